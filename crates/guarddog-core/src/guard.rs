//! The message pipeline.
//!
//! [`GuardDog`] runs every inbound message through the gates in order and
//! stops at the first one that denies it:
//!
//! ```text
//! disabled? ─▶ bypass? ─▶ challenge ─▶ behavior ─▶ rate limit ─▶ content filter
//!   allow      record       block        block        block       block / warn
//!                          + render                               / allow + record
//! ```
//!
//! Bypass traffic skips every gate but is still recorded so it counts in
//! later similarity checks. The content filter is either the
//! [`SimilarityFilter`], which records only accepted messages, or the
//! [`RiskScorer`], which records every message it scores.
//!
//! # Thread Safety
//!
//! Messages from different identities never wait on each other apart from
//! the short global history and trust cache sections. Messages from the same
//! identity are serialized through a per-identity lane so that check and
//! record stay atomic.

use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::behavior::{BehaviorGate, Position};
use crate::challenge::{
    Challenge, ChallengeError, ChallengeGate, ChallengeManager, ChallengeOutcome, ChallengeSink, ChallengeState,
    NoopSink, REISSUE_MESSAGE, TrustStore,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{ContentFilter, GuardDogConfig};
use crate::error::GuardDogError;
use crate::identity::{IdentityId, IdentityMap, lock};
use crate::normalize::{ConfusableFolder, SkeletonTable};
use crate::rate_limit::RateLimiter;
use crate::risk::{ProfileStats, RiskInput, RiskLevel, RiskScorer};
use crate::similarity_filter::{BLOCK_MESSAGE, SimilarityFilter};

// =============================================================================
// Request / Response Types
// =============================================================================

/// One inbound chat message and what the host knows about its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    /// Sender.
    pub identity: IdentityId,
    /// Raw message text.
    pub message: String,
    /// Sender's network address.
    pub address: IpAddr,
    /// Privileged sender or explicit bypass grant.
    #[serde(default)]
    pub bypass: bool,
    /// Coarse sender statistics for the risk scorer.
    #[serde(default)]
    pub profile: ProfileStats,
    /// Sender position when the message was sent, counted as a movement
    /// sample.
    #[serde(default)]
    pub position: Option<Position>,
}

impl MessageContext {
    /// Creates a context with no bypass, empty statistics and no position.
    #[must_use]
    pub fn new(identity: impl Into<IdentityId>, message: impl Into<String>, address: IpAddr) -> Self {
        Self {
            identity: identity.into(),
            message: message.into(),
            address,
            bypass: false,
            profile: ProfileStats::default(),
            position: None,
        }
    }

    /// Marks the sender as exempt from every gate.
    #[must_use]
    pub const fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Attaches sender statistics.
    #[must_use]
    pub fn with_profile(mut self, profile: ProfileStats) -> Self {
        self.profile = profile;
        self
    }

    /// Attaches a movement sample.
    #[must_use]
    pub const fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

/// What happens to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Deliver.
    Allow,
    /// Deliver and show the sender the reason.
    Warn,
    /// Drop and show the sender the reason.
    Block,
}

/// The gate that produced a non-allow decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// Verification challenge.
    Challenge,
    /// Join age or movement.
    Behavior,
    /// Token bucket.
    RateLimit,
    /// Lightweight similarity filter.
    Similarity,
    /// Risk scorer.
    Risk,
}

/// Host action requested alongside a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    /// Show a challenge.
    RenderChallenge {
        /// What to render.
        challenge: Challenge,
    },
    /// Disconnect the sender.
    Disconnect {
        /// Shown on the disconnect screen.
        reason: String,
    },
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Deliver, warn or drop.
    pub outcome: Outcome,
    /// Text for the sender. Empty only for a silent allow.
    pub reason: Option<String>,
    /// Which gate decided, for non-silent decisions.
    pub gate: Option<Gate>,
    /// Host actions to perform.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<SideEffect>,
}

impl Decision {
    /// Silent allow.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            outcome: Outcome::Allow,
            reason: None,
            gate: None,
            side_effects: Vec::new(),
        }
    }

    fn block(gate: Gate, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Block,
            reason: Some(reason.into()),
            gate: Some(gate),
            side_effects: Vec::new(),
        }
    }

    fn with_effect(mut self, effect: SideEffect) -> Self {
        self.side_effects.push(effect);
        self
    }

    /// Returns `true` if the message should be delivered.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self.outcome, Outcome::Allow | Outcome::Warn)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`GuardDog`] with optional injected collaborators.
pub struct GuardDogBuilder {
    config: GuardDogConfig,
    clock: Option<SharedClock>,
    sink: Option<Arc<dyn ChallengeSink>>,
    trust: Option<Arc<TrustStore>>,
    folder: Option<Arc<dyn ConfusableFolder>>,
    seed: Option<u64>,
}

impl GuardDogBuilder {
    /// Starts from `config`.
    #[must_use]
    pub fn new(config: GuardDogConfig) -> Self {
        Self {
            config,
            clock: None,
            sink: None,
            trust: None,
            folder: None,
            seed: None,
        }
    }

    /// Time source. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Receiver for delayed challenge re-issues. Defaults to [`NoopSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ChallengeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Pre-built trust cache. Defaults to one opened from
    /// `guarddog.captcha.store_path`, or an in-memory one when
    /// `guarddog.captcha.persist` is off.
    #[must_use]
    pub fn trust_store(mut self, trust: Arc<TrustStore>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Confusable folder for the risk scorer.
    #[must_use]
    pub fn confusable_folder(mut self, folder: Arc<dyn ConfusableFolder>) -> Self {
        self.folder = Some(folder);
        self
    }

    /// Seeds challenge generation.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the trust file
    /// cannot be loaded.
    pub fn build(self) -> Result<GuardDog, GuardDogError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopSink));
        let folder = self.folder.unwrap_or_else(|| Arc::new(SkeletonTable));
        let guard = &self.config.guarddog;
        let duration = guard.captcha.verification_duration();

        let trust = match (self.trust, guard.captcha.trust_file()) {
            (Some(trust), _) => trust,
            (None, Some(path)) => Arc::new(TrustStore::open(path, duration, Arc::clone(&clock))?),
            (None, None) => Arc::new(TrustStore::in_memory(duration, Arc::clone(&clock))),
        };

        let challenges = match self.seed {
            Some(seed) => ChallengeManager::with_seed(guard.captcha.clone(), trust, sink, seed),
            None => ChallengeManager::new(guard.captcha.clone(), trust, sink),
        };

        Ok(GuardDog {
            challenges,
            behavior: BehaviorGate::new(guard.heuristics.clone(), Arc::clone(&clock)),
            rate_limiter: RateLimiter::new(guard.ratelimit.clone(), Arc::clone(&clock)),
            similarity: SimilarityFilter::new(guard.similarity.clone()),
            risk: RiskScorer::with_folder(self.config.antispam.clone(), clock, folder),
            lanes: IdentityMap::new(),
            config: RwLock::new(self.config),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Chat abuse detection engine.
#[derive(Debug)]
pub struct GuardDog {
    config: RwLock<GuardDogConfig>,
    challenges: ChallengeManager,
    behavior: BehaviorGate,
    rate_limiter: RateLimiter,
    similarity: SimilarityFilter,
    risk: RiskScorer,
    lanes: IdentityMap<()>,
}

impl GuardDog {
    /// Builds an engine with default collaborators.
    ///
    /// # Errors
    ///
    /// See [`GuardDogBuilder::build`].
    pub fn new(config: GuardDogConfig) -> Result<Self, GuardDogError> {
        GuardDogBuilder::new(config).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(config: GuardDogConfig) -> GuardDogBuilder {
        GuardDogBuilder::new(config)
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> GuardDogConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `ctx` through the pipeline.
    pub fn evaluate(&self, ctx: &MessageContext) -> Decision {
        let config = self.config();
        let guard = &config.guarddog;
        if !guard.enabled {
            return Decision::allow();
        }

        let id = &ctx.identity;
        let lane = self.lanes.get_or_insert_with(id, || ());
        let _lane = lock(&lane);

        if let Some(position) = ctx.position {
            self.behavior.on_move(id, position);
        }

        if ctx.bypass {
            self.record_bypass(&config, ctx);
            return Decision::allow();
        }

        if guard.captcha.enabled {
            match self.challenges.gate(id, ctx.address) {
                ChallengeGate::Pass => {},
                ChallengeGate::Issued(challenge) => {
                    return Decision::block(Gate::Challenge, challenge.prompt())
                        .with_effect(SideEffect::RenderChallenge { challenge });
                },
                ChallengeGate::Pending => return Decision::block(Gate::Challenge, REISSUE_MESSAGE),
            }
        }

        if guard.heuristics.enabled {
            if let Some(reason) = self.behavior.failure_reason(id) {
                tracing::debug!(identity = %id, reason = %reason, "behavior gate denied message");
                return Decision::block(Gate::Behavior, reason);
            }
        }

        if guard.ratelimit.enabled {
            if let Err(limited) = self.rate_limiter.try_consume(id) {
                return Decision::block(Gate::RateLimit, limited.user_message());
            }
        }

        match guard.content_filter {
            ContentFilter::Similarity => self.run_similarity(&config, ctx),
            ContentFilter::Risk => self.run_risk(ctx),
        }
    }

    fn record_bypass(&self, config: &GuardDogConfig, ctx: &MessageContext) {
        match config.guarddog.content_filter {
            ContentFilter::Similarity if config.guarddog.similarity.enabled => {
                self.similarity.record(&ctx.identity, &ctx.message);
            },
            ContentFilter::Similarity => {},
            ContentFilter::Risk => self.risk.record_only(&ctx.identity, &ctx.message),
        }
    }

    fn run_similarity(&self, config: &GuardDogConfig, ctx: &MessageContext) -> Decision {
        if !config.guarddog.similarity.enabled {
            return Decision::allow();
        }
        if let Some(hit) = self.similarity.find_similar(&ctx.identity, &ctx.message) {
            tracing::info!(
                identity = %ctx.identity,
                scope = ?hit.scope,
                similarity = hit.similarity,
                "message blocked as repeat"
            );
            return Decision::block(Gate::Similarity, BLOCK_MESSAGE);
        }
        self.similarity.record(&ctx.identity, &ctx.message);
        Decision::allow()
    }

    fn run_risk(&self, ctx: &MessageContext) -> Decision {
        let distance_moved = self.behavior.tracker(&ctx.identity).map(|t| t.distance());
        let assessment = self.risk.evaluate(
            &ctx.identity,
            &RiskInput {
                message: &ctx.message,
                profile: &ctx.profile,
                distance_moved,
            },
        );

        let reason = assessment.message();
        match assessment.level {
            RiskLevel::Spam | RiskLevel::Suspicious => Decision {
                outcome: Outcome::Block,
                reason,
                gate: Some(Gate::Risk),
                side_effects: Vec::new(),
            },
            RiskLevel::Warn => Decision {
                outcome: Outcome::Warn,
                reason,
                gate: Some(Gate::Risk),
                side_effects: Vec::new(),
            },
            RiskLevel::Clean => Decision::allow(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts tracking a newly connected identity.
    pub fn on_join(&self, id: &IdentityId, position: Position) {
        self.behavior.on_join(id, position);
    }

    /// Records a position update.
    pub fn on_move(&self, id: &IdentityId, position: Position) {
        self.behavior.on_move(id, position);
    }

    /// Forgets everything about a disconnected identity and cancels any
    /// pending challenge re-issue. Trust records are kept.
    pub fn on_disconnect(&self, id: &IdentityId) {
        self.challenges.end_session(id);
        self.behavior.remove(id);
        self.rate_limiter.remove(id);
        self.similarity.remove(id);
        self.risk.remove(id);
        self.lanes.remove(id);
        tracing::debug!(identity = %id, "identity state purged");
    }

    /// Handles a challenge answer.
    ///
    /// # Errors
    ///
    /// Returns [`ChallengeError::NoActiveSession`] if `id` has no open
    /// challenge.
    pub fn respond_to_challenge(&self, id: &IdentityId, option: u32) -> Result<Decision, ChallengeError> {
        let outcome = self.challenges.respond(id, option)?;
        let message = outcome.message();
        Ok(match outcome {
            ChallengeOutcome::Verified => Decision {
                outcome: Outcome::Allow,
                reason: Some(message),
                gate: Some(Gate::Challenge),
                side_effects: Vec::new(),
            },
            ChallengeOutcome::Retry { challenge, .. } => {
                Decision::block(Gate::Challenge, message).with_effect(SideEffect::RenderChallenge { challenge })
            },
            ChallengeOutcome::Failed => Decision::block(Gate::Challenge, message.clone())
                .with_effect(SideEffect::Disconnect { reason: message }),
        })
    }

    /// Handles a challenge being closed without an answer. Returns `true` if
    /// a re-issue was scheduled.
    pub fn dismiss_challenge(&self, id: &IdentityId) -> bool {
        self.challenges.dismiss(id)
    }

    /// Applies a new configuration.
    ///
    /// Trust records, join/movement tracking and open challenges survive.
    /// Rate-limit buckets, similarity history and risk scores are cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation; the running
    /// configuration is left untouched.
    pub fn reload(&self, config: GuardDogConfig) -> Result<(), GuardDogError> {
        config.validate()?;
        let guard = &config.guarddog;

        self.challenges.reconfigure(guard.captcha.clone());
        self.behavior.reconfigure(guard.heuristics.clone());
        self.rate_limiter.reconfigure(guard.ratelimit.clone());
        self.similarity.reconfigure(guard.similarity.clone());
        self.risk.reconfigure(config.antispam.clone());

        if guard.captcha.trust_file() != self.challenges.trust().path() {
            tracing::warn!("captcha.persist and captcha.store_path changes take effect on restart");
        }

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        tracing::info!("configuration reloaded");
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Shared trust cache.
    #[must_use]
    pub const fn trust(&self) -> &Arc<TrustStore> {
        self.challenges.trust()
    }

    /// Challenge state for `id`.
    #[must_use]
    pub fn challenge_state(&self, id: &IdentityId) -> ChallengeState {
        self.challenges.state(id)
    }

    /// Current risk score for `id`.
    #[must_use]
    pub fn risk_score(&self, id: &IdentityId) -> u32 {
        self.risk.score(id)
    }

    /// Forgives `id`'s accumulated risk score.
    pub fn reset_risk_score(&self, id: &IdentityId) {
        self.risk.reset_score(id);
    }

    /// Tokens `id` could spend right now.
    #[must_use]
    pub fn remaining_tokens(&self, id: &IdentityId) -> u32 {
        self.rate_limiter.remaining_tokens(id)
    }

    /// Returns `true` if the engine holds any per-identity state for `id`.
    #[must_use]
    pub fn is_tracked(&self, id: &IdentityId) -> bool {
        self.lanes.contains(id)
            || self.behavior.tracker(id).is_some()
            || self.challenges.has_pending(id)
            || self.risk.score(id) > 0
            || self.rate_limiter.remaining_tokens(id) < self.rate_limiter.config().max_burst
    }
}
