//! Reducer trait and the type-erased reducer engine.
//!
//! Reducers are pure transition functions over one state slice. They read the
//! slice they are given and the action, and return the next slice value.
//!
//! # Key Properties
//!
//! - **Pure**: No IO, no async, no captured mutable state
//! - **Deterministic**: Same `(state, action)` always yields an equal result
//! - **Referential no-op**: Returning the input `Arc` means "nothing changed"
//! - **Fan-out via slices**: Every registered slice reducer sees every action

use std::any::type_name;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, error};

use crate::core::{Action, Revision, SliceKey, SliceValue, State};
use crate::error::{extract_panic_message, StoreError};

/// A pure state transition over one slice.
///
/// # No-op Convention
///
/// Actions a reducer doesn't recognize must be answered with the input state
/// itself (`Ok(Arc::clone(state))`), never an error. The engine compares the
/// returned `Arc` by pointer to decide whether the slice changed.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use statehub::Reducer;
///
/// struct CounterReducer;
///
/// impl Reducer<CounterAction, i64> for CounterReducer {
///     fn reduce(&self, state: &Arc<i64>, action: &CounterAction) -> anyhow::Result<Arc<i64>> {
///         match action {
///             CounterAction::Increment => Ok(Arc::new(**state + 1)),
///             CounterAction::Add(n) => Ok(Arc::new(**state + n)),
///             _ => Ok(Arc::clone(state)),
///         }
///     }
/// }
/// ```
pub trait Reducer<A, S>: Send + Sync + 'static {
    /// Compute the next slice value.
    ///
    /// Returning `Err` aborts the whole dispatch and leaves the store
    /// untouched.
    fn reduce(&self, state: &Arc<S>, action: &A) -> anyhow::Result<Arc<S>>;
}

impl<A, S, F> Reducer<A, S> for F
where
    F: Fn(&Arc<S>, &A) -> anyhow::Result<Arc<S>> + Send + Sync + 'static,
{
    fn reduce(&self, state: &Arc<S>, action: &A) -> anyhow::Result<Arc<S>> {
        self(state, action)
    }
}

/// Adapter for infallible reducers that work on plain values.
///
/// The wrapped function returns `Some(next)` for a change and `None` to keep
/// the current value.
///
/// # Example
///
/// ```ignore
/// let counter = pure_reducer(|count: &i64, action: &CounterAction| match action {
///     CounterAction::Increment => Some(count + 1),
///     _ => None,
/// });
/// ```
pub struct PureReducer<F> {
    transition: F,
}

/// Wrap an infallible `(&S, &A) -> Option<S>` function as a [`Reducer`].
pub fn pure_reducer<A, S, F>(transition: F) -> PureReducer<F>
where
    F: Fn(&S, &A) -> Option<S> + Send + Sync + 'static,
{
    PureReducer { transition }
}

impl<A, S, F> Reducer<A, S> for PureReducer<F>
where
    F: Fn(&S, &A) -> Option<S> + Send + Sync + 'static,
{
    fn reduce(&self, state: &Arc<S>, action: &A) -> anyhow::Result<Arc<S>> {
        Ok(match (self.transition)(state, action) {
            Some(next) => Arc::new(next),
            None => Arc::clone(state),
        })
    }
}

/// Result of running one slice reducer.
pub(crate) enum SliceOutcome {
    Unchanged,
    Changed(SliceValue),
}

/// Type-erased slice reducer for internal use.
trait AnySliceReducer<A>: Send + Sync {
    fn reduce_any(&self, current: &SliceValue, action: &A) -> anyhow::Result<SliceOutcome>;
}

struct TypedSlice<S, R> {
    reducer: R,
    _state: PhantomData<fn() -> S>,
}

impl<A, S, R> AnySliceReducer<A> for TypedSlice<S, R>
where
    S: Send + Sync + 'static,
    R: Reducer<A, S>,
{
    fn reduce_any(&self, current: &SliceValue, action: &A) -> anyhow::Result<SliceOutcome> {
        let typed = current.clone().downcast::<S>().map_err(|_| {
            anyhow!(
                "slice holds a value of unexpected type (expected {})",
                type_name::<S>()
            )
        })?;
        let next = self.reducer.reduce(&typed, action)?;
        if Arc::ptr_eq(&typed, &next) {
            Ok(SliceOutcome::Unchanged)
        } else {
            Ok(SliceOutcome::Changed(next))
        }
    }
}

/// Type-erased wrapper binding a slice key to its reducer and initial value.
struct SliceRunner<A> {
    key: SliceKey,
    initial: SliceValue,
    inner: Box<dyn AnySliceReducer<A>>,
    /// Human-readable state type for debugging.
    state_type: &'static str,
}

/// Registry of slice reducers that composes them into one transition.
///
/// Slices are reduced in registration order. A new snapshot is assembled
/// only when at least one slice returned a different `Arc`; otherwise the
/// input snapshot is handed back unchanged.
///
/// # Example
///
/// ```ignore
/// let mut engine = ReducerEngine::new();
/// engine.register("count", 0i64, counter_reducer)?;
/// engine.register("user", User::anonymous(), user_reducer)?;
///
/// let state = engine.initial_state();
/// let next = engine.reduce(&state, &CounterAction::Increment)?;
/// assert!(!State::ptr_eq(&state, &next));
/// ```
pub struct ReducerEngine<A> {
    slices: Vec<SliceRunner<A>>,
    catch_panics: bool,
}

impl<A: Action> ReducerEngine<A> {
    /// Create an empty engine that converts reducer panics into errors.
    pub fn new() -> Self {
        Self {
            slices: Vec::new(),
            catch_panics: true,
        }
    }

    /// Choose whether reducer panics are caught (default) or propagated.
    pub fn set_catch_panics(&mut self, catch_panics: bool) {
        self.catch_panics = catch_panics;
    }

    /// Register a reducer for a named slice.
    ///
    /// Returns [`StoreError::DuplicateSlice`] if the key is already taken.
    pub fn register<S, R>(
        &mut self,
        key: impl Into<SliceKey>,
        initial: S,
        reducer: R,
    ) -> Result<(), StoreError>
    where
        S: Send + Sync + 'static,
        R: Reducer<A, S>,
    {
        let key = key.into();
        if self.contains(key.as_str()) {
            return Err(StoreError::DuplicateSlice { key });
        }

        let state_type = type_name::<S>();
        debug!(slice = %key, state_type, "registered slice reducer");

        self.slices.push(SliceRunner {
            key,
            initial: Arc::new(initial),
            inner: Box::new(TypedSlice {
                reducer,
                _state: PhantomData,
            }),
            state_type,
        });
        Ok(())
    }

    /// Check whether a slice is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.slices.iter().any(|s| s.key.as_str() == key)
    }

    /// Slice keys in registration order.
    pub fn slice_keys(&self) -> impl Iterator<Item = &SliceKey> {
        self.slices.iter().map(|s| &s.key)
    }

    /// Number of registered slices.
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Check if no slices are registered.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub(crate) fn initial_slices(&self) -> BTreeMap<SliceKey, SliceValue> {
        self.slices
            .iter()
            .map(|s| (s.key.clone(), s.initial.clone()))
            .collect()
    }

    /// Build the revision-0 snapshot from the registered initial values.
    pub fn initial_state(&self) -> State {
        State::from_slices(Revision::INITIAL, self.initial_slices())
    }

    /// Reduce `state` by `action`.
    ///
    /// Returns the same snapshot (see [`State::ptr_eq`]) when no slice
    /// changed.
    pub fn reduce(&self, state: &State, action: &A) -> Result<State, StoreError> {
        self.reduce_tracked(state, action).map(|(next, _)| next)
    }

    /// Reduce and report which slices changed, in registration order.
    pub(crate) fn reduce_tracked(
        &self,
        state: &State,
        action: &A,
    ) -> Result<(State, Vec<SliceKey>), StoreError> {
        let mut changes: Vec<(SliceKey, SliceValue)> = Vec::new();

        for slice in &self.slices {
            let current = state.slice(slice.key.as_str()).unwrap_or(&slice.initial);
            match self.run_slice(slice, current, action)? {
                SliceOutcome::Unchanged => {}
                SliceOutcome::Changed(next) => changes.push((slice.key.clone(), next)),
            }
        }

        if changes.is_empty() {
            return Ok((state.clone(), Vec::new()));
        }

        let changed = changes.iter().map(|(key, _)| key.clone()).collect();
        Ok((state.with_changes(changes), changed))
    }

    fn run_slice(
        &self,
        slice: &SliceRunner<A>,
        current: &SliceValue,
        action: &A,
    ) -> Result<SliceOutcome, StoreError> {
        let result = if self.catch_panics {
            // The reducer only sees shared references, so nothing observable is
            // left half-updated if it unwinds.
            catch_unwind(AssertUnwindSafe(|| slice.inner.reduce_any(current, action)))
                .unwrap_or_else(|panic_info| {
                    let panic_msg = extract_panic_message(&panic_info);
                    error!(
                        slice = %slice.key,
                        state_type = slice.state_type,
                        panic = %panic_msg,
                        "reducer panicked"
                    );
                    Err(anyhow!("reducer panicked: {}", panic_msg))
                })
        } else {
            slice.inner.reduce_any(current, action)
        };

        result.map_err(|source| StoreError::ReducerExecution {
            slice: slice.key.clone(),
            action: action.kind().into_owned(),
            source,
        })
    }
}

impl<A: Action> Default for ReducerEngine<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> std::fmt::Debug for ReducerEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerEngine")
            .field(
                "slices",
                &self
                    .slices
                    .iter()
                    .map(|s| (s.key.as_str(), s.state_type))
                    .collect::<Vec<_>>(),
            )
            .field("catch_panics", &self.catch_panics)
            .finish()
    }
}
