//! Structured error types for statehub.
//!
//! `StoreError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! `anyhow` stays the transport inside reducers and listeners; the store wraps
//! it at the boundary so callers always get a `StoreError`.
//!
//! # Propagation
//!
//! - Setup errors (`DuplicateSlice`, `Config`) are immediate and local.
//! - Per-dispatch errors (`ReducerExecution`, `DispatchOverflow`) abort only
//!   that dispatch; the store keeps its last good state.
//! - Subscriber errors are isolated from each other and from the pipeline.
//!   They are collected per dispatch cycle and reported once.
//!
//! # Example
//!
//! ```ignore
//! use statehub::StoreError;
//!
//! match store.dispatch(action) {
//!     Ok(report) => {
//!         for failure in &report.failures {
//!             tracing::warn!(subscriber = %failure.subscriber, "listener failed");
//!         }
//!     }
//!     Err(StoreError::ReducerExecution { slice, .. }) => {
//!         eprintln!("reducer for {} rejected the action", slice);
//!     }
//!     Err(e) => eprintln!("dispatch failed: {}", e),
//! }
//! ```

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::core::{Revision, SliceKey};
use crate::subscription::SubscriberId;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Two reducers claimed the same slice key.
    ///
    /// Fatal to setup: the store cannot be built until the caller fixes it.
    #[error("slice already registered: {key}")]
    DuplicateSlice {
        /// The contested slice key.
        key: SliceKey,
    },

    /// A reducer returned an error or panicked during dispatch.
    ///
    /// The dispatch was rolled back; state is unchanged.
    #[error("reducer for slice '{slice}' failed on action '{action}': {source}")]
    ReducerExecution {
        /// The slice whose reducer failed.
        slice: SliceKey,
        /// The kind of the action being reduced.
        action: String,
        /// The underlying reducer error.
        #[source]
        source: anyhow::Error,
    },

    /// Too many actions were queued within one dispatch cycle.
    ///
    /// Usually a listener that dispatches on every notification.
    #[error("dispatch overflow: more than {limit} actions queued within one dispatch cycle")]
    DispatchOverflow {
        /// The configured queue bound.
        limit: usize,
    },

    /// One or more subscribers failed during notification.
    #[error("{} subscriber(s) failed during notification", .0.len())]
    SubscriberNotification(Vec<SubscriberNotificationError>),

    /// Invalid store configuration.
    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Returns true if this error rolled back a dispatch.
    pub fn is_rollback(&self) -> bool {
        matches!(self, StoreError::ReducerExecution { .. })
    }
}

/// A subscriber callback failed while being notified.
///
/// Collected, never thrown inline, so other subscribers still run.
#[derive(Debug)]
pub struct SubscriberNotificationError {
    /// The failing subscriber.
    pub subscriber: SubscriberId,
    /// Optional label given at registration.
    pub label: Option<&'static str>,
    /// The revision being delivered when the failure happened.
    pub revision: Revision,
    /// What went wrong.
    pub source: anyhow::Error,
}

impl fmt::Display for SubscriberNotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(
                f,
                "subscriber {} ({}) failed at {}: {}",
                self.subscriber, label, self.revision, self.source
            ),
            None => write!(
                f,
                "subscriber {} failed at {}: {}",
                self.subscriber, self.revision, self.source
            ),
        }
    }
}

impl std::error::Error for SubscriberNotificationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn extract_panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
