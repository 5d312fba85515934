//! Composite risk scoring.
//!
//! The heavier content filter. Every message is run through a set of
//! independent [`signals`], the points are summed, and the sum is added to
//! the sender's decayed prior score:
//!
//! ```text
//! score = floor(prior * decay_factor) + sum(penalties)
//! ```
//!
//! The resulting score is classified against three thresholds:
//!
//! | Score                     | Level        | Effect            |
//! |---------------------------|--------------|-------------------|
//! | `>= block_threshold`      | `Spam`       | block             |
//! | `>= soft_block_threshold` | `Suspicious` | block, softer text|
//! | `>= warn_threshold`       | `Warn`       | allow with warning|
//! | below                     | `Clean`      | allow silently    |
//!
//! Every evaluated message is appended to the sender's history and the
//! global history, blocked or not, so retrying a blocked message keeps
//! raising its similarity score.
//!
//! # Thread Safety
//!
//! Per-sender state sits behind the sender's own lock in an
//! [`IdentityMap`]. The global window is locked only while it is scanned or
//! appended to, always after the sender lock.

pub mod signals;

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

pub use self::signals::{Penalties, Penalty};
use crate::clock::SharedClock;
use crate::history::{GlobalHistory, HistoryWindow};
use crate::identity::{IdentityId, IdentityMap};
use crate::normalize::{ConfusableFolder, SkeletonTable, normalize_with};

/// Per-signal switches (`[antispam.signals]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct SignalToggles {
    /// Sender profile (experience, playtime, activity).
    pub profile: bool,
    /// Movement since join.
    pub movement: bool,
    /// Time since the previous message.
    pub velocity: bool,
    /// Similarity to the sender's own history.
    pub self_similarity: bool,
    /// Similarity to the global history.
    pub global_similarity: bool,
    /// Uppercase ratio.
    pub caps: bool,
    /// Repeated character runs.
    pub repetition: bool,
    /// Separator density.
    pub separators: bool,
    /// Zero-width characters.
    pub invisible: bool,
    /// Digit/symbol substitution.
    pub substitution: bool,
}

impl Default for SignalToggles {
    fn default() -> Self {
        Self::all()
    }
}

impl SignalToggles {
    /// Every signal on.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            profile: true,
            movement: true,
            velocity: true,
            self_similarity: true,
            global_similarity: true,
            caps: true,
            repetition: true,
            separators: true,
            invisible: true,
            substitution: true,
        }
    }

    /// Every signal off.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            profile: false,
            movement: false,
            velocity: false,
            self_similarity: false,
            global_similarity: false,
            caps: false,
            repetition: false,
            separators: false,
            invisible: false,
            substitution: false,
        }
    }
}

/// Risk scorer settings (`[antispam]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Similarity to own history that counts as a repeat.
    pub self_similarity_threshold: f64,
    /// Similarity to global history that counts as a repeat.
    pub global_similarity_threshold: f64,
    /// Messages remembered per sender.
    pub history_size: usize,
    /// Messages remembered across all senders.
    pub global_history_size: usize,
    /// Whether lack of movement is penalized.
    pub require_movement: bool,
    /// Blocks a sender must walk to clear the movement penalty for good.
    pub min_movement_distance: f64,
    /// Multiplier applied to the prior score on every message.
    pub decay_factor: f64,
    /// Score that blocks with the strong wording.
    pub block_threshold: u32,
    /// Score that blocks with the softer wording.
    pub soft_block_threshold: u32,
    /// Score that warns.
    pub warn_threshold: u32,
    /// Points per signal.
    pub penalties: Penalties,
    /// Which signals run.
    pub signals: SignalToggles,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            self_similarity_threshold: 0.80,
            global_similarity_threshold: 0.85,
            history_size: 10,
            global_history_size: 30,
            require_movement: true,
            min_movement_distance: 2.0,
            decay_factor: 0.7,
            block_threshold: 100,
            soft_block_threshold: 75,
            warn_threshold: 50,
            penalties: Penalties::default(),
            signals: SignalToggles::default(),
        }
    }
}

/// Coarse sender statistics supplied by the host. `None` means the host
/// could not provide the counter, which scores as the least-trusted tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileStats {
    /// Experience level.
    pub level: u32,
    /// Total experience points.
    pub total_experience: u32,
    /// Minutes played on this server.
    pub playtime_minutes: Option<u64>,
    /// Blocks mined.
    pub blocks_mined: Option<u64>,
    /// Centimeters walked.
    pub distance_walked_cm: Option<u64>,
}

/// One message to score.
#[derive(Debug, Clone, Copy)]
pub struct RiskInput<'a> {
    /// Raw message text.
    pub message: &'a str,
    /// Sender statistics.
    pub profile: &'a ProfileStats,
    /// Horizontal blocks walked since join, if movement has been tracked.
    pub distance_moved: Option<f64>,
}

/// Score classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Below the warn threshold.
    Clean,
    /// Allowed, sender warned.
    Warn,
    /// Blocked with the softer wording.
    Suspicious,
    /// Blocked.
    Spam,
}

/// Result of scoring one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    /// Sender score after this message.
    pub score: u32,
    /// Points this message added.
    pub added: u32,
    /// Classification of `score`.
    pub level: RiskLevel,
    /// Reasons from the signals that fired.
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    /// Returns `true` if the message must not be delivered.
    #[must_use]
    pub const fn blocks(&self) -> bool {
        matches!(self.level, RiskLevel::Suspicious | RiskLevel::Spam)
    }

    /// Text for the sender, if any.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        let reasons = self.reasons.join(", ");
        match self.level {
            RiskLevel::Spam => Some(format!("Spam detected: {reasons}. Calm down!")),
            RiskLevel::Suspicious => Some(format!("Possible spam: {reasons}. Slow down!")),
            RiskLevel::Warn => Some(format!("Warning: {reasons}")),
            RiskLevel::Clean => None,
        }
    }
}

/// `floor(prior * decay) + added`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn decay_and_accumulate(prior: u32, decay: f64, added: u32) -> u32 {
    let decayed = (f64::from(prior) * decay.clamp(0.0, 1.0) + signals::FLOOR_TOLERANCE).floor() as u32;
    decayed.saturating_add(added)
}

#[derive(Debug)]
struct RiskState {
    score: u32,
    last_message_ms: Option<u64>,
    moved: bool,
    history: HistoryWindow,
}

impl RiskState {
    fn new(history_size: usize) -> Self {
        Self {
            score: 0,
            last_message_ms: None,
            moved: false,
            history: HistoryWindow::new(history_size),
        }
    }
}

/// Decaying per-sender spam score.
pub struct RiskScorer {
    config: RwLock<RiskConfig>,
    clock: SharedClock,
    folder: Arc<dyn ConfusableFolder>,
    states: IdentityMap<RiskState>,
    global: GlobalHistory,
}

impl std::fmt::Debug for RiskScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskScorer")
            .field("tracked", &self.states.len())
            .field("global_history", &self.global.len())
            .finish_non_exhaustive()
    }
}

impl RiskScorer {
    /// Creates a scorer using the built-in confusable table.
    #[must_use]
    pub fn new(config: RiskConfig, clock: SharedClock) -> Self {
        Self::with_folder(config, clock, Arc::new(SkeletonTable))
    }

    /// Creates a scorer with a custom confusable folder.
    #[must_use]
    pub fn with_folder(config: RiskConfig, clock: SharedClock, folder: Arc<dyn ConfusableFolder>) -> Self {
        let global = GlobalHistory::new(config.global_history_size);
        Self {
            config: RwLock::new(config),
            clock,
            folder,
            states: IdentityMap::new(),
            global,
        }
    }

    /// Active settings.
    #[must_use]
    pub fn config(&self) -> RiskConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies new settings and forgets every score and history.
    pub fn reconfigure(&self, config: RiskConfig) {
        let global_size = config.global_history_size;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.states.clear();
        self.global.reset(global_size);
    }

    /// Scores one message and records it.
    pub fn evaluate(&self, id: &IdentityId, input: &RiskInput<'_>) -> RiskAssessment {
        let config = self.config();
        let now = self.clock.now_ms();
        let normalized = normalize_with(input.message, self.folder.as_ref());

        let assessment = self.states.with_or_insert(
            id,
            || RiskState::new(config.history_size),
            |state| {
                let penalties = self.collect_penalties(&config, state, input, &normalized, now);
                let added = penalties.iter().map(|p| p.points).sum();
                let reasons = penalties.into_iter().filter_map(|p| p.reason).collect();

                state.score = decay_and_accumulate(state.score, config.decay_factor, added);
                if !normalized.is_empty() {
                    state.history.record(normalized.clone());
                    self.global.record(normalized.clone());
                }

                RiskAssessment {
                    score: state.score,
                    added,
                    level: classify(state.score, &config),
                    reasons,
                }
            },
        );

        if assessment.blocks() {
            tracing::info!(
                identity = %id,
                score = assessment.score,
                reasons = ?assessment.reasons,
                "message blocked by risk score"
            );
        } else {
            tracing::debug!(
                identity = %id,
                score = assessment.score,
                added = assessment.added,
                "message scored"
            );
        }

        assessment
    }

    fn collect_penalties(
        &self,
        config: &RiskConfig,
        state: &mut RiskState,
        input: &RiskInput<'_>,
        normalized: &str,
        now: u64,
    ) -> Vec<Penalty> {
        let toggles = &config.signals;
        let points = &config.penalties;
        let mut out = Vec::new();

        if toggles.profile {
            out.extend(signals::profile_penalty(input.profile, points));
        }

        if toggles.movement && config.require_movement && !state.moved {
            match signals::movement_penalty(input.distance_moved, config.min_movement_distance, points) {
                Some(penalty) => out.push(penalty),
                None => state.moved = true,
            }
        }

        if toggles.velocity {
            let since_last = state.last_message_ms.map(|last| now.saturating_sub(last));
            out.extend(signals::velocity_penalty(since_last, points));
        }
        state.last_message_ms = Some(now);

        // An empty canonical form carries no content to compare.
        if !normalized.is_empty() {
            if toggles.self_similarity {
                let threshold = config.self_similarity_threshold;
                if let Some(score) = state.history.best_match(normalized, threshold) {
                    out.push(signals::self_similarity_penalty(score, threshold));
                }
            }
            if toggles.global_similarity {
                let threshold = config.global_similarity_threshold;
                if let Some(score) = self.global.best_match(normalized, threshold) {
                    out.push(signals::global_similarity_penalty(score, threshold));
                }
            }
        }

        let raw = input.message;
        if toggles.caps {
            out.extend(signals::caps_penalty(raw));
        }
        if toggles.repetition {
            out.extend(signals::repetition_penalty(raw, points));
        }
        if toggles.separators {
            out.extend(signals::separator_penalty(raw));
        }
        if toggles.invisible {
            out.extend(signals::invisible_penalty(raw, points));
        }
        if toggles.substitution {
            out.extend(signals::substitution_penalty(raw, points));
        }

        out
    }

    /// Appends a message to the histories without scoring it.
    pub fn record_only(&self, id: &IdentityId, message: &str) {
        let normalized = normalize_with(message, self.folder.as_ref());
        if normalized.is_empty() {
            return;
        }
        let history_size = self.config().history_size;
        self.states.with_or_insert(
            id,
            || RiskState::new(history_size),
            |state| state.history.record(normalized.clone()),
        );
        self.global.record(normalized);
    }

    /// Current score for `id`, zero if unknown.
    #[must_use]
    pub fn score(&self, id: &IdentityId) -> u32 {
        self.states.with_existing(id, |state| state.score).unwrap_or(0)
    }

    /// Clears `id`'s score. History and movement state are kept.
    pub fn reset_score(&self, id: &IdentityId) {
        self.states.with_existing(id, |state| state.score = 0);
    }

    /// Forgets `id`.
    pub fn remove(&self, id: &IdentityId) {
        self.states.remove(id);
    }

    /// Forgets every sender and the global history.
    pub fn clear(&self) {
        self.states.clear();
        self.global.clear();
    }

    /// Number of senders with state.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.states.len()
    }
}

fn classify(score: u32, config: &RiskConfig) -> RiskLevel {
    if score >= config.block_threshold {
        RiskLevel::Spam
    } else if score >= config.soft_block_threshold {
        RiskLevel::Suspicious
    } else if score >= config.warn_threshold {
        RiskLevel::Warn
    } else {
        RiskLevel::Clean
    }
}
