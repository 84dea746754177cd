//! Bounded transition log for development visibility.
//!
//! Every dispatch the store processes leaves one [`TransitionRecord`]: which
//! action ran, whether it changed anything, which slices moved, and how many
//! subscribers fired or failed.
//!
//! # Purpose
//!
//! The log catches:
//! - Wiring mistakes (actions no reducer handles)
//! - Chatty listeners (dispatch loops, failures on every cycle)
//! - Unexpected slice churn
//!
//! # Usage
//!
//! ```ignore
//! for record in store.transitions().unchanged() {
//!     tracing::warn!(action = %record.action, "action changed nothing");
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{Revision, SliceKey};

/// What a dispatch did to the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// A new snapshot was installed.
    Applied {
        /// Slices whose value changed, in registration order.
        changed_slices: Vec<String>,
    },
    /// Every reducer returned its input; no snapshot was built.
    Unchanged,
    /// A reducer failed; the dispatch was rolled back.
    Rejected {
        /// The rendered error.
        error: String,
    },
    /// The store was reset to its initial slice values.
    Reset,
}

/// A single entry for one dispatch cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    /// Revision after the cycle (unchanged for no-ops and rejections).
    pub revision: Revision,
    /// The action kind.
    pub action: String,
    /// What happened.
    #[serde(flatten)]
    pub outcome: TransitionOutcome,
    /// Subscribers that fired.
    pub notified: usize,
    /// Subscribers that failed.
    pub failed: usize,
    /// When the cycle finished.
    pub at: DateTime<Utc>,
}

impl TransitionRecord {
    pub(crate) fn applied(revision: Revision, action: String, changed: &[SliceKey]) -> Self {
        Self::new(
            revision,
            action,
            TransitionOutcome::Applied {
                changed_slices: changed.iter().map(|k| k.as_str().to_string()).collect(),
            },
        )
    }

    pub(crate) fn new(revision: Revision, action: String, outcome: TransitionOutcome) -> Self {
        Self {
            revision,
            action,
            outcome,
            notified: 0,
            failed: 0,
            at: Utc::now(),
        }
    }

    pub(crate) fn with_notification(mut self, notified: usize, failed: usize) -> Self {
        self.notified = notified;
        self.failed = failed;
        self
    }

    /// Returns true if the cycle installed a new snapshot.
    pub fn was_applied(&self) -> bool {
        matches!(
            self.outcome,
            TransitionOutcome::Applied { .. } | TransitionOutcome::Reset
        )
    }
}

/// Thread-safe ring of recent transition records.
#[derive(Debug)]
pub struct TransitionLog {
    entries: Mutex<VecDeque<TransitionRecord>>,
    limit: usize,
}

impl TransitionLog {
    /// Create a log retaining at most `limit` records (0 disables recording).
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit,
        }
    }

    /// Acquire the entries lock, recovering from poison if necessary.
    fn lock_entries(&self) -> MutexGuard<'_, VecDeque<TransitionRecord>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a transition, evicting the oldest when full.
    pub fn record(&self, record: TransitionRecord) {
        if self.limit == 0 {
            return;
        }
        let mut entries = self.lock_entries();
        while entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// All retained records, oldest first.
    pub fn entries(&self) -> Vec<TransitionRecord> {
        self.lock_entries().iter().cloned().collect()
    }

    /// The most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<TransitionRecord> {
        self.lock_entries().iter().rev().take(n).cloned().collect()
    }

    /// Records of dispatches that changed nothing.
    pub fn unchanged(&self) -> Vec<TransitionRecord> {
        self.filtered(|r| r.outcome == TransitionOutcome::Unchanged)
    }

    /// Records of rolled-back dispatches.
    pub fn rejected(&self) -> Vec<TransitionRecord> {
        self.filtered(|r| matches!(r.outcome, TransitionOutcome::Rejected { .. }))
    }

    fn filtered(&self, keep: impl Fn(&TransitionRecord) -> bool) -> Vec<TransitionRecord> {
        self.lock_entries()
            .iter()
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }

    /// Clear all records.
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Get summary statistics.
    pub fn stats(&self) -> TransitionStats {
        let entries = self.lock_entries();
        let mut stats = TransitionStats {
            total: entries.len(),
            ..TransitionStats::default()
        };
        for record in entries.iter() {
            match record.outcome {
                TransitionOutcome::Applied { .. } | TransitionOutcome::Reset => stats.applied += 1,
                TransitionOutcome::Unchanged => stats.unchanged += 1,
                TransitionOutcome::Rejected { .. } => stats.rejected += 1,
            }
            stats.subscriber_failures += record.failed;
        }
        stats
    }
}

/// Summary statistics from the transition log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionStats {
    /// Records retained.
    pub total: usize,
    /// Cycles that installed a snapshot.
    pub applied: usize,
    /// Cycles that changed nothing.
    pub unchanged: usize,
    /// Cycles rolled back by a reducer error.
    pub rejected: usize,
    /// Subscriber failures across all retained cycles.
    pub subscriber_failures: usize,
}
