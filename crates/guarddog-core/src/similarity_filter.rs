//! Lightweight repeat-message filter.
//!
//! Blocks a message when its light-normalized form is at least `threshold`
//! similar to one of the sender's last few accepted messages or, if
//! `check_global_chat` is set, to one of the last accepted messages from
//! anyone. Unlike [`crate::risk::RiskScorer`], only messages that were
//! allowed through get recorded.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::history::{GlobalHistory, HistoryWindow};
use crate::identity::{IdentityId, IdentityMap};
use crate::normalize::normalize_light;

/// Text shown when a message is blocked.
pub const BLOCK_MESSAGE: &str = "Message blocked: too similar to recent messages.";

/// Similarity filter settings (`[guarddog.similarity]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Whether the filter runs at all.
    pub enabled: bool,
    /// Similarity at or above which a message counts as a repeat.
    pub threshold: f64,
    /// Also compare against everyone's recent messages.
    pub check_global_chat: bool,
    /// Accepted messages remembered per sender.
    pub history_size: usize,
    /// Accepted messages remembered across all senders.
    pub global_history_size: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.85,
            check_global_chat: true,
            history_size: 3,
            global_history_size: 10,
        }
    }
}

/// Which window a repeat was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchScope {
    /// The sender's own history.
    Own,
    /// The shared history.
    Global,
}

/// A message judged too similar to recent traffic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityMatch {
    /// Where the match was found.
    pub scope: MatchScope,
    /// Similarity of the matching entry.
    pub similarity: f64,
}

/// Per-sender and global repeat detection over accepted messages.
#[derive(Debug)]
pub struct SimilarityFilter {
    config: RwLock<SimilarityConfig>,
    histories: IdentityMap<HistoryWindow>,
    global: GlobalHistory,
}

impl SimilarityFilter {
    /// Creates a filter with empty histories.
    #[must_use]
    pub fn new(config: SimilarityConfig) -> Self {
        let global = GlobalHistory::new(config.global_history_size);
        Self {
            config: RwLock::new(config),
            histories: IdentityMap::new(),
            global,
        }
    }

    /// Active settings.
    #[must_use]
    pub fn config(&self) -> SimilarityConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies new settings and forgets all history.
    pub fn reconfigure(&self, config: SimilarityConfig) {
        let global_size = config.global_history_size;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.histories.clear();
        self.global.reset(global_size);
    }

    /// Looks for a recent message similar to `message`.
    #[must_use]
    pub fn find_similar(&self, id: &IdentityId, message: &str) -> Option<SimilarityMatch> {
        let normalized = normalize_light(message);
        if normalized.is_empty() {
            return None;
        }
        let config = self.config();

        let own = self
            .histories
            .with_existing(id, |history| history.best_match(&normalized, config.threshold))
            .flatten();
        if let Some(similarity) = own {
            return Some(SimilarityMatch {
                scope: MatchScope::Own,
                similarity,
            });
        }

        if config.check_global_chat {
            if let Some(similarity) = self.global.best_match(&normalized, config.threshold) {
                return Some(SimilarityMatch {
                    scope: MatchScope::Global,
                    similarity,
                });
            }
        }

        None
    }

    /// Returns `true` if `message` repeats recent traffic.
    #[must_use]
    pub fn is_similar(&self, id: &IdentityId, message: &str) -> bool {
        self.find_similar(id, message).is_some()
    }

    /// Remembers an accepted message.
    pub fn record(&self, id: &IdentityId, message: &str) {
        let normalized = normalize_light(message);
        if normalized.is_empty() {
            return;
        }
        let history_size = self.config().history_size;
        self.histories.with_or_insert(
            id,
            || HistoryWindow::new(history_size),
            |history| history.record(normalized.clone()),
        );
        self.global.record(normalized);
    }

    /// Forgets `id`'s history. The global window is kept.
    pub fn remove(&self, id: &IdentityId) {
        self.histories.remove(id);
    }

    /// Forgets all history.
    pub fn clear(&self) {
        self.histories.clear();
        self.global.clear();
    }

    /// Number of senders with history.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.histories.len()
    }
}
