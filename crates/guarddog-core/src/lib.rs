//! # guarddog-core
//!
//! Chat abuse detection for multiplayer servers.
//!
//! Every inbound chat message passes through a fixed pipeline of gates, each
//! of which may deny it with a human-readable reason:
//!
//! - **Challenge**: unverified addresses must pick the right item out of a
//!   grid before chatting. Successes are remembered per address for a
//!   configurable duration.
//! - **Behavior**: new arrivals must wait a few seconds and walk a few blocks.
//! - **Rate limit**: a per-identity token bucket.
//! - **Content filter**: either a lightweight near-duplicate check against
//!   recent accepted messages, or a composite decaying risk score built from
//!   profile, velocity, repetition and formatting signals.
//!
//! ## Example
//!
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use guarddog_core::{GuardDog, GuardDogConfig, MessageContext, Outcome};
//!
//! let mut config = GuardDogConfig::default();
//! config.guarddog.captcha.enabled = false;
//! config.guarddog.captcha.persist = false;
//! config.guarddog.heuristics.enabled = false;
//!
//! let guard = GuardDog::new(config).unwrap();
//! let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
//!
//! let first = guard.evaluate(&MessageContext::new("steve", "anyone want to trade?", addr));
//! assert_eq!(first.outcome, Outcome::Allow);
//!
//! let repeat = guard.evaluate(&MessageContext::new("steve", "anyone want to trade??", addr));
//! assert_eq!(repeat.outcome, Outcome::Block);
//! ```
//!
//! ## Modules
//!
//! - [`normalize`] and [`similarity`]: canonical text and edit-distance ratio
//! - [`history`]: bounded recent-message windows
//! - [`risk`]: the composite risk scorer
//! - [`similarity_filter`]: the lightweight repeat filter
//! - [`rate_limit`]: token buckets
//! - [`behavior`]: join-age and movement gate
//! - [`challenge`]: verification challenges and the trust cache
//! - [`guard`]: the pipeline tying them together

pub mod behavior;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod history;
pub mod identity;
pub mod normalize;
pub mod rate_limit;
pub mod risk;
pub mod similarity;
pub mod similarity_filter;

pub use behavior::{BehaviorConfig, BehaviorGate, Position};
pub use challenge::{
    Challenge, ChallengeConfig, ChallengeError, ChallengeManager, ChallengeOutcome, ChallengeSink, ChallengeState,
    TrustStore, TrustStoreError,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ContentFilter, GuardConfig, GuardDogConfig};
pub use error::GuardDogError;
pub use guard::{Decision, Gate, GuardDog, GuardDogBuilder, MessageContext, Outcome, SideEffect};
pub use identity::IdentityId;
pub use risk::{ProfileStats, RiskAssessment, RiskConfig, RiskLevel, RiskScorer};
pub use similarity::{edit_distance, similarity};
