//! Join-age and movement gating.
//!
//! Fresh bot accounts tend to chat the instant they spawn and never move.
//! The gate holds a sender's messages until both of these are true:
//!
//! - at least `min_account_age_seconds` have passed since join, and
//! - the sender has walked at least `min_move_distance` blocks horizontally.
//!
//! Vertical motion is ignored, as are deltas at or below
//! `movement_epsilon` (head turns report a position update with a tiny
//! delta). Once the distance requirement is met, accumulation stops.
//!
//! A sender with no join record does not pass.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::identity::{IdentityId, IdentityMap};

/// Behavior gate settings (`[guarddog.heuristics]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Whether the gate runs at all.
    pub enabled: bool,
    /// Horizontal blocks a sender must cover before chatting.
    pub min_move_distance: f64,
    /// Seconds a sender must be connected before chatting.
    pub min_account_age_seconds: u64,
    /// Position deltas at or below this are treated as jitter.
    pub movement_epsilon: f64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_move_distance: 2.0,
            min_account_age_seconds: 5,
            movement_epsilon: 0.01,
        }
    }
}

/// A position in the world. Only `x` and `z` count toward movement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// East-west.
    pub x: f64,
    /// Height.
    #[serde(default)]
    pub y: f64,
    /// North-south.
    pub z: f64,
}

impl Position {
    /// Creates a position.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Distance to `other` ignoring height.
    #[must_use]
    pub fn horizontal_distance(&self, other: &Self) -> f64 {
        (self.x - other.x).hypot(self.z - other.z)
    }
}

/// Per-sender join time and accumulated movement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementTracker {
    joined_at_ms: u64,
    last_position: Position,
    distance: f64,
}

impl MovementTracker {
    /// Starts tracking at `position`.
    #[must_use]
    pub const fn new(joined_at_ms: u64, position: Position) -> Self {
        Self {
            joined_at_ms,
            last_position: position,
            distance: 0.0,
        }
    }

    /// Accumulated horizontal distance.
    #[must_use]
    pub const fn distance(&self) -> f64 {
        self.distance
    }

    /// Join timestamp.
    #[must_use]
    pub const fn joined_at_ms(&self) -> u64 {
        self.joined_at_ms
    }

    fn observe(&mut self, position: Position, epsilon: f64, target: f64) {
        if self.distance >= target {
            return;
        }
        let delta = self.last_position.horizontal_distance(&position);
        if delta > epsilon {
            self.distance += delta;
            self.last_position = position;
        }
    }
}

/// Tracks join age and movement for every connected sender.
#[derive(Debug)]
pub struct BehaviorGate {
    config: RwLock<BehaviorConfig>,
    clock: SharedClock,
    trackers: IdentityMap<MovementTracker>,
}

impl BehaviorGate {
    /// Creates a gate with no tracked senders.
    #[must_use]
    pub fn new(config: BehaviorConfig, clock: SharedClock) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            trackers: IdentityMap::new(),
        }
    }

    /// Applies new thresholds. Tracked join times and distances are kept.
    pub fn reconfigure(&self, config: BehaviorConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Active settings.
    #[must_use]
    pub fn config(&self) -> BehaviorConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records a join, resetting any previous tracking for `id`.
    pub fn on_join(&self, id: &IdentityId, position: Position) {
        let now = self.clock.now_ms();
        self.trackers.insert(id, MovementTracker::new(now, position));
        tracing::trace!(identity = %id, "tracking join");
    }

    /// Records a position update. Ignored for senders with no join record.
    pub fn on_move(&self, id: &IdentityId, position: Position) {
        let config = self.config();
        self.trackers.with_existing(id, |tracker| {
            tracker.observe(position, config.movement_epsilon, config.min_move_distance);
        });
    }

    /// Returns `true` once both the age and movement requirements are met.
    #[must_use]
    pub fn passes(&self, id: &IdentityId) -> bool {
        self.has_waited_long_enough(id) && self.has_moved_enough(id)
    }

    /// Returns `true` once `id` has been connected long enough.
    #[must_use]
    pub fn has_waited_long_enough(&self, id: &IdentityId) -> bool {
        let now = self.clock.now_ms();
        let min_age_ms = self.config().min_account_age_seconds.saturating_mul(1_000);
        self.trackers
            .with_existing(id, |tracker| now.saturating_sub(tracker.joined_at_ms) >= min_age_ms)
            .unwrap_or(false)
    }

    /// Returns `true` once `id` has covered the required distance.
    #[must_use]
    pub fn has_moved_enough(&self, id: &IdentityId) -> bool {
        let target = self.config().min_move_distance;
        self.trackers
            .with_existing(id, |tracker| tracker.distance >= target)
            .unwrap_or(false)
    }

    /// Whole seconds until `id` satisfies the age requirement.
    #[must_use]
    pub fn seconds_until_can_chat(&self, id: &IdentityId) -> u64 {
        let now = self.clock.now_ms();
        let min_age = self.config().min_account_age_seconds;
        self.trackers
            .with_existing(id, |tracker| {
                let elapsed_secs = now.saturating_sub(tracker.joined_at_ms) / 1_000;
                min_age.saturating_sub(elapsed_secs)
            })
            .unwrap_or(min_age)
    }

    /// Blocks left to walk.
    #[must_use]
    pub fn distance_remaining(&self, id: &IdentityId) -> f64 {
        let target = self.config().min_move_distance;
        self.trackers
            .with_existing(id, |tracker| (target - tracker.distance).max(0.0))
            .unwrap_or(target)
    }

    /// Message explaining why `id` cannot chat yet, or `None` if it can.
    #[must_use]
    pub fn failure_reason(&self, id: &IdentityId) -> Option<String> {
        if !self.has_waited_long_enough(id) {
            let secs = self.seconds_until_can_chat(id).max(1);
            return Some(format!("Please wait {secs} more second(s) before chatting."));
        }
        if !self.has_moved_enough(id) {
            let remaining = self.distance_remaining(id);
            return Some(format!("Please move around ({remaining:.1} blocks remaining)."));
        }
        None
    }

    /// Returns the tracker for `id`.
    #[must_use]
    pub fn tracker(&self, id: &IdentityId) -> Option<MovementTracker> {
        self.trackers.with_existing(id, |tracker| *tracker)
    }

    /// Forgets `id`.
    pub fn remove(&self, id: &IdentityId) {
        self.trackers.remove(id);
    }

    /// Number of tracked senders.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.trackers.len()
    }
}
