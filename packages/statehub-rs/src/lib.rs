//! # Statehub
//!
//! A reducer-driven state container where reducers decide, the store
//! serializes, and subscribers observe.
//!
//! ## Core Concepts
//!
//! Statehub separates **instructions** from **snapshots**:
//! - [`Action`] = Instruction (what the caller wants to happen)
//! - [`State`] = Snapshot (what the store holds right now)
//!
//! The key principle: **One Dispatch = One Transition = One Notification Pass**.
//! If several slices must change together, they change in response to the
//! same action.
//!
//! ## Architecture
//!
//! ```text
//! Caller / Listener / spawned producer
//!     │
//!     ▼ dispatch()
//! Store pipeline ─ nested? ──► FIFO queue ─────────┐
//!     │                                            │
//!     ▼                                            │
//! ReducerEngine                                    │
//!     ├─► slice "count"  reducer ─► same Arc       │
//!     ├─► slice "post"   reducer ─► new Arc        │
//!     └─► slice "user"   reducer ─► same Arc       │
//!     │                                            │
//!     ▼ new snapshot (or the same one: no-op)      │
//! install ──► watch channel                        │
//!     │                                            │
//!     ▼                                            │
//! SubscriberRegistry.notify()                      │
//!     ├─► plain listeners                          │
//!     └─► selector listeners (gated by Equality)   │
//!             │                                    │
//!             └─► dispatch() ──────────────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Snapshots are immutable** - A transition yields the same snapshot or a new one
//! 2. **Reducers are pure** - No IO, no async, same input gives the same output
//! 3. **One transition at a time** - Nested dispatches are queued FIFO, never interleaved
//! 4. **At most one notification per cycle** - However many slices changed
//! 5. **Atomic dispatch** - A failing reducer leaves the state untouched
//! 6. **Memo entries recompute only on changed deps** - Under their equality policy
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use statehub::{Action, Store, StoreConfig};
//!
//! // 1. Define actions
//! #[derive(Debug, Clone)]
//! enum CounterAction {
//!     Increment,
//!     Add(i64),
//! }
//! impl Action for CounterAction {}
//!
//! // 2. Define a reducer (pure, returns its input for unknown actions)
//! fn counter(state: &Arc<i64>, action: &CounterAction) -> anyhow::Result<Arc<i64>> {
//!     match action {
//!         CounterAction::Increment => Ok(Arc::new(**state + 1)),
//!         CounterAction::Add(n) => Ok(Arc::new(**state + n)),
//!     }
//! }
//!
//! // 3. Build the store
//! let store = Store::builder()
//!     .with_config(StoreConfig::from_env()?)
//!     .with_slice("count", 0i64, counter)
//!     .build()?;
//!
//! // 4. Observe a derived value
//! store.subscribe_selector(
//!     |state| state.get::<i64>("count").copied().unwrap_or_default(),
//!     |count| {
//!         tracing::info!(count, "count changed");
//!         Ok(())
//!     },
//! );
//!
//! // 5. Dispatch
//! store.dispatch(CounterAction::Increment)?.into_result()?;
//! ```
//!
//! ## What This Is Not
//!
//! Statehub is **not**:
//! - A persistence layer
//! - A distributed state synchronizer
//! - A middleware or time-travel framework
//!
//! Statehub **is**:
//! > A reducer-driven state container where reducers decide, the store
//! > serializes, and subscribers observe.

// Core modules
mod config;
mod core;
mod error;
mod fetch;
mod memo;
mod reducer;
mod store;
mod subscription;

// Transition history for development visibility
pub mod audit;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{Action, Revision, SliceKey, State, TaggedAction};

// Re-export error types
pub use crate::error::{StoreError, SubscriberNotificationError};

// Re-export reducer types
pub use reducer::{pure_reducer, PureReducer, Reducer, ReducerEngine};

// Re-export store types (primary entry point)
pub use store::{DispatchStatus, Dispatched, Store, StoreBuilder};

// Re-export subscription types
pub use subscription::{SubscriberId, SubscriberRegistry, Subscription};

// Re-export memoization types
pub use memo::{memo, Equality, Memo, MemoCache, MemoKey};

// Re-export configuration
pub use config::{StoreConfig, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_QUEUE_DEPTH};

// Re-export fetch lifecycle types
pub use fetch::{FetchAction, FetchReducer, FetchState};

// Re-export transition log types
pub use audit::{TransitionLog, TransitionOutcome, TransitionRecord, TransitionStats};
