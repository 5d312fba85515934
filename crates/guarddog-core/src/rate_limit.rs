//! Per-identity token-bucket rate limiting.
//!
//! Each sender gets a bucket holding up to `max_burst` tokens, created full
//! on first use. One token is restored for every whole `refill_seconds`
//! interval that has elapsed since the last refill. A message consumes one
//! token; an empty bucket denies.
//!
//! # Thread Safety
//!
//! Buckets live in an [`IdentityMap`], so each bucket has its own critical
//! section and senders never contend with each other.
//!
//! # Invariants
//!
//! - Tokens stay within `[0, max_burst]`.
//! - Refill never removes tokens, and the refill timestamp only moves
//!   forward when at least one whole interval has elapsed.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::SharedClock;
use crate::identity::{IdentityId, IdentityMap};

const fn default_enabled() -> bool {
    true
}

const fn default_max_burst() -> u32 {
    3
}

const fn default_refill_seconds() -> u64 {
    2
}

/// Rate limiter settings (`[guarddog.ratelimit]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether the gate runs at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Bucket capacity, i.e. the largest burst a sender can post.
    #[serde(default = "default_max_burst")]
    pub max_burst: u32,

    /// Seconds per restored token.
    #[serde(default = "default_refill_seconds")]
    pub refill_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_burst: default_max_burst(),
            refill_seconds: default_refill_seconds(),
        }
    }
}

impl RateLimitConfig {
    /// Refill interval in milliseconds, never zero.
    #[must_use]
    pub const fn refill_interval_ms(&self) -> u64 {
        let ms = self.refill_seconds.saturating_mul(1_000);
        if ms == 0 { 1 } else { ms }
    }
}

/// Returned when a sender's bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit exceeded, next token in {}ms", retry_after.as_millis())]
pub struct RateLimitExceeded {
    /// Time until the next token is restored.
    pub retry_after: Duration,
}

impl RateLimitExceeded {
    /// Text shown to the sender. Always asks for at least one second.
    #[must_use]
    pub fn user_message(&self) -> String {
        let wait = self.retry_after.as_secs().max(1);
        format!("Slow down! Wait {wait}s before chatting again.")
    }
}

/// A single sender's token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    tokens: u32,
    max: u32,
    last_refill_ms: u64,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub const fn full(max: u32, now_ms: u64) -> Self {
        Self {
            tokens: max,
            max,
            last_refill_ms: now_ms,
        }
    }

    /// Restores one token per whole elapsed interval, capped at capacity.
    pub fn refill(&mut self, now_ms: u64, interval_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let intervals = elapsed / interval_ms.max(1);
        if intervals > 0 {
            let restored = u32::try_from(intervals).unwrap_or(u32::MAX);
            self.tokens = self.tokens.saturating_add(restored).min(self.max);
            self.last_refill_ms = now_ms;
        }
    }

    /// Refills, then takes a token if one is available.
    pub fn try_consume(&mut self, now_ms: u64, interval_ms: u64) -> bool {
        self.refill(now_ms, interval_ms);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Time until the next token, or zero if one is available.
    #[must_use]
    pub const fn ms_until_refill(&self, now_ms: u64, interval_ms: u64) -> u64 {
        if self.tokens > 0 {
            return 0;
        }
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        interval_ms.saturating_sub(elapsed)
    }

    /// Tokens currently held.
    #[must_use]
    pub const fn tokens(&self) -> u32 {
        self.tokens
    }
}

/// Token-bucket limiter keyed by identity.
#[derive(Debug)]
pub struct RateLimiter {
    config: RwLock<RateLimitConfig>,
    clock: SharedClock,
    buckets: IdentityMap<TokenBucket>,
}

impl RateLimiter {
    /// Creates a limiter with no tracked senders.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            buckets: IdentityMap::new(),
        }
    }

    /// Applies new settings and drops every bucket.
    pub fn reconfigure(&self, config: RateLimitConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.buckets.clear();
    }

    fn settings(&self) -> (u32, u64) {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        (config.max_burst, config.refill_interval_ms())
    }

    /// Consumes one token for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the bucket is empty.
    pub fn try_consume(&self, id: &IdentityId) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now_ms();
        let (max, interval) = self.settings();

        self.buckets.with_or_insert(
            id,
            || TokenBucket::full(max, now),
            |bucket| {
                if bucket.try_consume(now, interval) {
                    Ok(())
                } else {
                    let retry_after = Duration::from_millis(bucket.ms_until_refill(now, interval));
                    tracing::debug!(
                        identity = %id,
                        retry_after_ms = retry_after.as_millis(),
                        "rate limit exceeded"
                    );
                    Err(RateLimitExceeded { retry_after })
                }
            },
        )
    }

    /// Whole seconds until `id` regains a token; zero if it has one or is
    /// unknown.
    #[must_use]
    pub fn seconds_until_refill(&self, id: &IdentityId) -> u64 {
        let now = self.clock.now_ms();
        let (_, interval) = self.settings();
        self.buckets
            .with_existing(id, |bucket| {
                let mut projected = *bucket;
                projected.refill(now, interval);
                projected.ms_until_refill(now, interval) / 1_000
            })
            .unwrap_or(0)
    }

    /// Tokens `id` could spend right now. Unknown senders have a full bucket.
    #[must_use]
    pub fn remaining_tokens(&self, id: &IdentityId) -> u32 {
        let now = self.clock.now_ms();
        let (max, interval) = self.settings();
        self.buckets
            .with_existing(id, |bucket| {
                let mut projected = *bucket;
                projected.refill(now, interval);
                projected.tokens()
            })
            .unwrap_or(max)
    }

    /// Forgets `id`'s bucket.
    pub fn remove(&self, id: &IdentityId) {
        self.buckets.remove(id);
    }

    /// Forgets every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Number of senders with a bucket.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.buckets.len()
    }

    /// Active settings.
    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
