//! Human verification challenges.
//!
//! An address that has not recently proven a human is behind it must solve
//! a pick-the-right-option challenge before its messages are evaluated any
//! further. Solved challenges are cached per address in a [`TrustStore`];
//! the challenge itself is tracked per identity.
//!
//! # State Machine
//!
//! ```text
//!                 gated message, address untrusted
//!     ┌──────┐  ─────────────────────────────────▶  ┌────────────┐
//!     │ None │                                       │ Challenged │◀─┐
//!     └──────┘  ◀─────────────────────────────────  └─────┬──────┘  │ wrong answer
//!         ▲              disconnect                       │         │ (attempts < max)
//!         │                                               ├─────────┘ or dismissal
//!         │                   ┌───────────────────────────┴──────────────┐
//!         │            correct answer                       wrong answer,
//!         │                   │                             attempts == max
//!         │                   ▼                                          ▼
//!         │             ┌──────────┐                         ┌────────────────┐
//!         └──────────── │ Verified │                         │ FailedTerminal │
//!                       └──────────┘                         └────────────────┘
//! ```
//!
//! `Verified` and `FailedTerminal` end the session immediately: the first
//! writes a trust record for the session's address, the second asks the host
//! to disconnect the identity. A new session starts with zero attempts.
//!
//! # Re-issue
//!
//! Dismissing a challenge without answering schedules a re-issue after
//! `reissue_delay_ms`. The timer runs on the ambient tokio runtime and is
//! aborted when the session ends for any reason. Without a runtime the
//! challenge is re-issued immediately.

pub mod trust;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::trust::{TrustStore, TrustStoreError};
use crate::identity::{IdentityId, IdentityMap};

/// Shown after a correct answer.
pub const SUCCESS_MESSAGE: &str = "✓ Verification successful! You can now chat.";
/// Disconnect reason after too many wrong answers.
pub const FAILURE_MESSAGE: &str = "Failed captcha verification. Please reconnect.";
/// Shown when a dismissed challenge is re-issued.
pub const REISSUE_MESSAGE: &str = "You must complete the captcha to chat!";

/// Labels the correct option is drawn from.
pub const OPTION_CATALOG: &[&str] = &[
    "Sponge",
    "Diamond",
    "Emerald",
    "Gold Ingot",
    "Iron Ingot",
    "Apple",
    "Cookie",
    "Cake",
    "Melon Slice",
    "Bread",
    "Carrot",
    "Potato",
];

/// Trust file used when none is configured, relative to the working directory.
pub const DEFAULT_STORE_PATH: &str = "guarddog_verified.json";

/// Challenge settings (`[guarddog.captcha]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Whether unverified addresses are challenged.
    pub enabled: bool,
    /// Hours a solved challenge is honored for an address.
    pub duration_hours: u64,
    /// Wrong answers allowed before disconnect.
    pub max_attempts: u32,
    /// Options shown, one of which is correct.
    pub option_count: u32,
    /// Delay before re-issuing a dismissed challenge.
    pub reissue_delay_ms: u64,
    /// Whether solved challenges are written to `store_path`.
    pub persist: bool,
    /// Trust file location.
    pub store_path: PathBuf,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_hours: 24,
            max_attempts: 3,
            option_count: 27,
            reissue_delay_ms: 1_000,
            persist: true,
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
        }
    }
}

impl ChallengeConfig {
    /// Where trust records are persisted, or `None` when kept in memory.
    #[must_use]
    pub fn trust_file(&self) -> Option<&Path> {
        self.persist.then_some(self.store_path.as_path())
    }

    /// How long a solved challenge is honored.
    #[must_use]
    pub const fn verification_duration(&self) -> Duration {
        Duration::from_secs(self.duration_hours.saturating_mul(60 * 60))
    }

    /// Delay before re-issuing a dismissed challenge.
    #[must_use]
    pub const fn reissue_delay(&self) -> Duration {
        Duration::from_millis(self.reissue_delay_ms)
    }
}

/// What the host must render. Only the option indexed by `correct_option`
/// is the right answer; the rest are decoys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Index of the correct option, `< option_count`.
    pub correct_option: u32,
    /// Total options shown.
    pub option_count: u32,
    /// Name of the correct option.
    pub label: String,
}

impl Challenge {
    /// Instruction shown alongside the options.
    #[must_use]
    pub fn prompt(&self) -> String {
        format!("Please click the {} to verify you are human.", self.label)
    }

    /// Decoy options shown.
    #[must_use]
    pub const fn decoy_count(&self) -> u32 {
        self.option_count.saturating_sub(1)
    }
}

/// Errors from answering a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    /// The identity has no open challenge.
    #[error("no active challenge for {identity}")]
    NoActiveSession {
        /// Identity that answered.
        identity: String,
    },
}

/// Observable per-identity state. `Verified` and `FailedTerminal` are
/// reported through [`ChallengeOutcome`] and immediately return to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    /// No open challenge.
    None,
    /// Waiting for an answer.
    Challenged {
        /// Wrong answers so far.
        attempts: u32,
    },
}

/// Result of gating a message on verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeGate {
    /// Address is trusted; continue.
    Pass,
    /// A new challenge was opened and must be rendered.
    Issued(Challenge),
    /// A challenge is already open.
    Pending,
}

/// Result of answering a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Correct. The address is now trusted.
    Verified,
    /// Wrong, attempts remain. The challenge is shown again.
    Retry {
        /// Attempts left before disconnect.
        remaining: u32,
        /// Challenge to render again.
        challenge: Challenge,
    },
    /// Wrong, no attempts left. The identity must be disconnected.
    Failed,
}

impl ChallengeOutcome {
    /// Text shown to the identity.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Verified => SUCCESS_MESSAGE.to_string(),
            Self::Retry { remaining, .. } => format!("✗ Wrong item! {remaining} attempts remaining."),
            Self::Failed => FAILURE_MESSAGE.to_string(),
        }
    }
}

/// Host hooks for side effects raised outside a request, i.e. re-issues.
pub trait ChallengeSink: Send + Sync {
    /// Show `challenge` to `id`.
    fn render_challenge(&self, id: &IdentityId, challenge: &Challenge);

    /// Send `message` to `id`.
    fn notify(&self, id: &IdentityId, message: &str);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ChallengeSink for NoopSink {
    fn render_challenge(&self, _id: &IdentityId, _challenge: &Challenge) {}

    fn notify(&self, _id: &IdentityId, _message: &str) {}
}

enum Answer {
    Correct(IpAddr),
    Wrong { remaining: u32, challenge: Challenge },
    Exhausted,
}

enum Dismissal {
    Scheduled,
    AlreadyScheduled,
    Immediate(Challenge),
}

struct ChallengeSession {
    challenge: Challenge,
    address: IpAddr,
    attempts: u32,
    reissue: Option<tokio::task::JoinHandle<()>>,
}

impl ChallengeSession {
    fn cancel_reissue(&mut self) {
        if let Some(handle) = self.reissue.take() {
            handle.abort();
        }
    }
}

/// Per-identity challenge sessions over a shared [`TrustStore`].
pub struct ChallengeManager {
    config: RwLock<ChallengeConfig>,
    trust: Arc<TrustStore>,
    sessions: Arc<IdentityMap<ChallengeSession>>,
    rng: Mutex<StdRng>,
    sink: Arc<dyn ChallengeSink>,
}

impl std::fmt::Debug for ChallengeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeManager")
            .field("sessions", &self.sessions.len())
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

impl ChallengeManager {
    /// Creates a manager drawing challenges from OS entropy.
    #[must_use]
    pub fn new(config: ChallengeConfig, trust: Arc<TrustStore>, sink: Arc<dyn ChallengeSink>) -> Self {
        Self::with_rng(config, trust, sink, StdRng::from_entropy())
    }

    /// Creates a manager with a deterministic challenge sequence.
    #[must_use]
    pub fn with_seed(config: ChallengeConfig, trust: Arc<TrustStore>, sink: Arc<dyn ChallengeSink>, seed: u64) -> Self {
        Self::with_rng(config, trust, sink, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ChallengeConfig, trust: Arc<TrustStore>, sink: Arc<dyn ChallengeSink>, rng: StdRng) -> Self {
        Self {
            config: RwLock::new(config),
            trust,
            sessions: Arc::new(IdentityMap::new()),
            rng: Mutex::new(rng),
            sink,
        }
    }

    /// Active settings.
    #[must_use]
    pub fn config(&self) -> ChallengeConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies new settings. Open sessions and trust records are kept.
    pub fn reconfigure(&self, config: ChallengeConfig) {
        self.trust
            .set_verification_duration(config.verification_duration());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Shared trust cache.
    #[must_use]
    pub const fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    fn generate(&self) -> Challenge {
        let option_count = self.config().option_count.max(2);
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Challenge {
            correct_option: rng.gen_range(0..option_count),
            option_count,
            label: OPTION_CATALOG[rng.gen_range(0..OPTION_CATALOG.len())].to_string(),
        }
    }

    /// Checks `address` and opens a challenge for `id` if needed.
    pub fn gate(&self, id: &IdentityId, address: IpAddr) -> ChallengeGate {
        if self.trust.is_verified(address) {
            // Another identity on this address may have solved it meanwhile.
            // The read-locked probe keeps the common path off the map's write lock.
            if self.sessions.contains(id) {
                self.end_session(id);
            }
            return ChallengeGate::Pass;
        }

        let mut issued = None;
        self.sessions.with_or_insert(
            id,
            || {
                let challenge = self.generate();
                issued = Some(challenge.clone());
                ChallengeSession {
                    challenge,
                    address,
                    attempts: 0,
                    reissue: None,
                }
            },
            |_| {},
        );

        match issued {
            Some(challenge) => {
                tracing::info!(identity = %id, address = %address, "challenge issued");
                ChallengeGate::Issued(challenge)
            },
            None => ChallengeGate::Pending,
        }
    }

    /// Handles an answer from `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ChallengeError::NoActiveSession`] if `id` has no open
    /// challenge.
    pub fn respond(&self, id: &IdentityId, option: u32) -> Result<ChallengeOutcome, ChallengeError> {
        let max_attempts = self.config().max_attempts.max(1);

        let answer = self
            .sessions
            .with_existing(id, |session| {
                if option == session.challenge.correct_option {
                    session.cancel_reissue();
                    return Answer::Correct(session.address);
                }
                session.attempts += 1;
                if session.attempts >= max_attempts {
                    session.cancel_reissue();
                    Answer::Exhausted
                } else {
                    Answer::Wrong {
                        remaining: max_attempts - session.attempts,
                        challenge: session.challenge.clone(),
                    }
                }
            })
            .ok_or_else(|| ChallengeError::NoActiveSession {
                identity: id.to_string(),
            })?;

        Ok(match answer {
            Answer::Correct(address) => {
                self.sessions.remove(id);
                self.trust.mark_verified(address);
                tracing::info!(identity = %id, "challenge solved");
                ChallengeOutcome::Verified
            },
            Answer::Exhausted => {
                self.sessions.remove(id);
                tracing::warn!(identity = %id, attempts = max_attempts, "challenge failed, disconnecting");
                ChallengeOutcome::Failed
            },
            Answer::Wrong { remaining, challenge } => {
                tracing::debug!(identity = %id, remaining, "wrong challenge answer");
                ChallengeOutcome::Retry { remaining, challenge }
            },
        })
    }

    /// Handles `id` closing the challenge without answering.
    ///
    /// Returns `true` if a re-issue was scheduled or delivered.
    pub fn dismiss(&self, id: &IdentityId) -> bool {
        let delay = self.config().reissue_delay();
        let runtime = tokio::runtime::Handle::try_current().ok();

        let action = self.sessions.with_existing(id, |session| {
            if session.reissue.as_ref().is_some_and(|h| !h.is_finished()) {
                return Dismissal::AlreadyScheduled;
            }
            let Some(runtime) = &runtime else {
                return Dismissal::Immediate(session.challenge.clone());
            };

            let sessions = Arc::clone(&self.sessions);
            let sink = Arc::clone(&self.sink);
            let id = id.clone();
            session.reissue = Some(runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                reissue(&sessions, sink.as_ref(), &id);
            }));
            Dismissal::Scheduled
        });

        match action {
            Some(Dismissal::Scheduled) => true,
            Some(Dismissal::Immediate(challenge)) => {
                tracing::debug!(identity = %id, "no async runtime, re-issuing challenge now");
                self.sink.render_challenge(id, &challenge);
                self.sink.notify(id, REISSUE_MESSAGE);
                true
            },
            Some(Dismissal::AlreadyScheduled) | None => false,
        }
    }

    /// Drops `id`'s session and any pending re-issue.
    pub fn end_session(&self, id: &IdentityId) {
        if let Some(entry) = self.sessions.remove(id) {
            entry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancel_reissue();
        }
    }

    /// Current state for `id`.
    #[must_use]
    pub fn state(&self, id: &IdentityId) -> ChallengeState {
        self.sessions
            .with_existing(id, |session| ChallengeState::Challenged {
                attempts: session.attempts,
            })
            .unwrap_or(ChallengeState::None)
    }

    /// Returns `true` if `id` has an open challenge.
    #[must_use]
    pub fn has_pending(&self, id: &IdentityId) -> bool {
        self.sessions.contains(id)
    }

    /// The open challenge for `id`.
    #[must_use]
    pub fn current(&self, id: &IdentityId) -> Option<Challenge> {
        self.sessions.with_existing(id, |session| session.challenge.clone())
    }

    /// Number of open challenges.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

fn reissue(sessions: &IdentityMap<ChallengeSession>, sink: &dyn ChallengeSink, id: &IdentityId) {
    let challenge = sessions.with_existing(id, |session| {
        session.reissue = None;
        session.challenge.clone()
    });
    if let Some(challenge) = challenge {
        tracing::debug!(identity = %id, "re-issuing dismissed challenge");
        sink.render_challenge(id, &challenge);
        sink.notify(id, REISSUE_MESSAGE);
    }
}
