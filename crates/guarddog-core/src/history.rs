//! Bounded windows of recent normalized messages.
//!
//! A [`HistoryWindow`] keeps the most recent entries first and evicts the
//! oldest once its capacity is exceeded. [`GlobalHistory`] wraps one window
//! shared by every sender behind a single mutex; the critical section covers
//! one scan or one insert.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::similarity::similarity;

/// Fixed-capacity, most-recent-first message window.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    capacity: usize,
    entries: VecDeque<String>,
}

impl HistoryWindow {
    /// Creates an empty window. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Inserts at the front, evicting from the back beyond capacity.
    pub fn record(&mut self, normalized: impl Into<String>) {
        self.entries.push_front(normalized.into());
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// Similarity of the first entry scoring at least `threshold`.
    ///
    /// Scans most recent first and stops at the first match.
    #[must_use]
    pub fn best_match(&self, normalized: &str, threshold: f64) -> Option<f64> {
        self.entries
            .iter()
            .map(|entry| similarity(normalized, entry))
            .find(|&score| score >= threshold)
    }

    /// Returns `true` if any entry scores at least `threshold`.
    #[must_use]
    pub fn matches_threshold(&self, normalized: &str, threshold: f64) -> bool {
        self.best_match(normalized, threshold).is_some()
    }

    /// Entries, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries kept.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The window shared by all senders.
#[derive(Debug)]
pub struct GlobalHistory {
    window: Mutex<HistoryWindow>,
}

impl GlobalHistory {
    /// Creates an empty shared window.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(HistoryWindow::new(capacity)),
        }
    }

    /// See [`HistoryWindow::record`].
    pub fn record(&self, normalized: impl Into<String>) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(normalized);
    }

    /// See [`HistoryWindow::best_match`].
    #[must_use]
    pub fn best_match(&self, normalized: &str, threshold: f64) -> Option<f64> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .best_match(normalized, threshold)
    }

    /// See [`HistoryWindow::matches_threshold`].
    #[must_use]
    pub fn matches_threshold(&self, normalized: &str, threshold: f64) -> bool {
        self.best_match(normalized, threshold).is_some()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry and applies a new capacity.
    pub fn reset(&self, capacity: usize) {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = HistoryWindow::new(capacity);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
