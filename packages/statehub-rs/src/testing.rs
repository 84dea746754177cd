//! Testing utilities for reducers and stores.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! statehub = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Using `assert_transitions!`
//!
//! ```ignore
//! use statehub::testing::assert_transitions;
//!
//! assert_transitions!(
//!     counter_reducer, 0i64,
//!     CounterAction::Increment => 1,
//!     CounterAction::Add(4) => 5,
//!     CounterAction::Unknown => 5,
//! );
//! ```
//!
//! ## Using the Fluent Builder
//!
//! ```ignore
//! use statehub::testing::ReducerTest;
//!
//! ReducerTest::new(counter_reducer, 0i64)
//!     .given(CounterAction::Increment)
//!     .expect(1)
//!     .then(CounterAction::Unknown)
//!     .expect_unchanged()
//!     .then(CounterAction::Divide(0))
//!     .expect_error();
//! ```
//!
//! ## Recording Notifications
//!
//! ```ignore
//! use statehub::testing::Recorder;
//!
//! let counts = Recorder::new();
//! store.subscribe_selector(count, counts.listener());
//!
//! store.dispatch(CounterAction::Increment)?;
//! assert_eq!(counts.values(), vec![1]);
//! ```

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::Notify;

use crate::core::State;
use crate::reducer::Reducer;

/// Asserts a sequence of `action => expected` slice transitions.
///
/// Each action is reduced against the result of the previous one, starting
/// from the given initial value.
///
/// # Panics
///
/// Panics if a reducer fails or yields an unexpected value.
#[macro_export]
macro_rules! assert_transitions {
    ($reducer:expr, $initial:expr, $($action:expr => $expected:expr),+ $(,)?) => {{
        let reducer = $reducer;
        let mut state = ::std::sync::Arc::new($initial);
        $(
            let action = $action;
            state = $crate::Reducer::reduce(&reducer, &state, &action)
                .unwrap_or_else(|e| panic!("reducer failed on {:?}: {:#}", action, e));
            assert_eq!(
                *state, $expected,
                "Unexpected state after {:?}\n  expected: {:?}\n  actual: {:?}",
                action, $expected, *state
            );
        )+
    }};
}

pub use assert_transitions;

/// Fluent test builder for a single slice reducer.
pub struct ReducerTest<A, S, R> {
    reducer: R,
    state: Arc<S>,
    last: Option<Result<Arc<S>>>,
    previous: Arc<S>,
    _action: PhantomData<fn(A)>,
}

impl<A, S, R> ReducerTest<A, S, R>
where
    A: Debug,
    S: Debug + PartialEq,
    R: Reducer<A, S>,
{
    /// Create a test starting from `initial`.
    pub fn new(reducer: R, initial: S) -> Self {
        let state = Arc::new(initial);
        Self {
            reducer,
            previous: Arc::clone(&state),
            state,
            last: None,
            _action: PhantomData,
        }
    }

    /// Reduce the first action.
    pub fn given(self, action: A) -> Self {
        self.then(action)
    }

    /// Reduce a follow-up action against the current value.
    ///
    /// A failed reduction leaves the current value in place.
    pub fn then(mut self, action: A) -> Self {
        let result = self.reducer.reduce(&self.state, &action);
        self.previous = Arc::clone(&self.state);
        if let Ok(next) = &result {
            self.state = Arc::clone(next);
        }
        self.last = Some(result);
        self
    }

    /// Assert the current value.
    pub fn expect(self, expected: S) -> Self {
        assert_eq!(
            *self.state, expected,
            "State mismatch\n  expected: {:?}\n  actual: {:?}",
            expected, self.state
        );
        self
    }

    /// Assert the last action returned its input by reference.
    pub fn expect_unchanged(self) -> Self {
        match &self.last {
            Some(Ok(next)) => assert!(
                Arc::ptr_eq(next, &self.previous),
                "Expected no-op, got {:?}",
                next
            ),
            Some(Err(e)) => panic!("Expected no-op, reducer failed: {:#}", e),
            None => panic!("No action reduced yet"),
        }
        self
    }

    /// Assert the last action produced a new value.
    pub fn expect_changed(self) -> Self {
        match &self.last {
            Some(Ok(next)) => assert!(
                !Arc::ptr_eq(next, &self.previous),
                "Expected a new value, got the input back"
            ),
            Some(Err(e)) => panic!("Expected a change, reducer failed: {:#}", e),
            None => panic!("No action reduced yet"),
        }
        self
    }

    /// Assert the last action failed.
    pub fn expect_error(self) -> Self {
        assert!(
            matches!(self.last, Some(Err(_))),
            "Expected reducer error, got {:?}",
            self.last.as_ref().map(|r| r.as_ref().ok())
        );
        self
    }

    /// Assert the current value matches a predicate.
    pub fn assert_state<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&S) -> bool,
    {
        assert!(predicate(&self.state), "State predicate failed for {:?}", self.state);
        self
    }

    /// The current value.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Consume the test and return the current value.
    pub fn into_state(self) -> Arc<S> {
        self.state
    }
}

/// Records values delivered to a listener.
///
/// Clones share the same recording.
#[derive(Debug)]
pub struct Recorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a value.
    pub fn record(&self, value: T) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(value);
    }

    /// A selector listener that records every derived value it receives.
    pub fn listener(&self) -> impl Fn(&T) -> Result<()> + Send + Sync + 'static {
        let recorder = self.clone();
        move |value: &T| {
            recorder.record(value.clone());
            Ok(())
        }
    }

    /// Everything recorded so far, oldest first.
    pub fn values(&self) -> Vec<T> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of recorded values.
    pub fn count(&self) -> usize {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The most recent value.
    pub fn last(&self) -> Option<T> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl<T: Clone + Send + 'static> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits until a store has delivered an expected number of notification
/// passes, typically from dispatches spawned with [`Store::spawn_dispatch`].
///
/// [`Store::spawn_dispatch`]: crate::Store::spawn_dispatch
///
/// ```ignore
/// let cycles = NotificationLatch::expecting(2);
/// store.subscribe(cycles.listener());
///
/// store.spawn_dispatch(first);
/// store.spawn_dispatch(second);
/// cycles.wait().await;
/// ```
#[derive(Debug, Clone)]
pub struct NotificationLatch {
    pending: Arc<AtomicUsize>,
    done: Arc<Notify>,
}

impl NotificationLatch {
    /// A latch that opens after `cycles` notifications.
    pub fn expecting(cycles: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(cycles)),
            done: Arc::new(Notify::new()),
        }
    }

    /// Count one notification pass.
    ///
    /// # Panics
    ///
    /// Panics if the store notified more often than the latch expected,
    /// which usually means an action applied that the test did not plan for.
    pub fn count_notification(&self) {
        let before = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match before {
            Ok(1) => self.done.notify_waiters(),
            Ok(_) => {}
            Err(_) => panic!("store delivered more notifications than the latch expected"),
        }
    }

    /// A plain listener that counts every notification it receives.
    pub fn listener(&self) -> impl Fn(&State) -> Result<()> + Send + Sync + 'static {
        let latch = self.clone();
        move |_: &State| {
            latch.count_notification();
            Ok(())
        }
    }

    /// Resolve once every expected notification has been delivered.
    pub async fn wait(&self) {
        loop {
            // Register interest first so a notification racing this check is not lost
            let opened = self.done.notified();
            if self.pending() == 0 {
                return;
            }
            opened.await;
        }
    }

    /// Notification passes still expected.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Action;
    use crate::store::Store;
    use anyhow::anyhow;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    enum CounterAction {
        Increment,
        Add(i64),
        Divide(i64),
        Unknown,
    }
    impl Action for CounterAction {}

    fn counter(state: &Arc<i64>, action: &CounterAction) -> Result<Arc<i64>> {
        match action {
            CounterAction::Increment => Ok(Arc::new(**state + 1)),
            CounterAction::Add(n) => Ok(Arc::new(**state + n)),
            CounterAction::Divide(0) => Err(anyhow!("division by zero")),
            CounterAction::Divide(n) => Ok(Arc::new(**state / n)),
            CounterAction::Unknown => Ok(Arc::clone(state)),
        }
    }

    #[test]
    fn test_assert_transitions_macro() {
        assert_transitions!(
            counter, 0i64,
            CounterAction::Increment => 1,
            CounterAction::Add(4) => 5,
            CounterAction::Unknown => 5,
        );
    }

    #[test]
    fn test_reducer_test_builder() {
        let final_state = ReducerTest::new(counter, 0i64)
            .given(CounterAction::Increment)
            .expect_changed()
            .expect(1)
            .then(CounterAction::Unknown)
            .expect_unchanged()
            .then(CounterAction::Divide(0))
            .expect_error()
            .expect(1)
            .assert_state(|n| *n > 0)
            .into_state();

        assert_eq!(*final_state, 1);
    }

    #[test]
    #[should_panic(expected = "Expected no-op")]
    fn test_expect_unchanged_catches_copies() {
        ReducerTest::new(counter, 0i64)
            .given(CounterAction::Add(0))
            .expect_unchanged();
    }

    #[test]
    fn test_recorder_with_selector() {
        let store = Store::<CounterAction>::builder()
            .with_slice("count", 0i64, counter)
            .build()
            .unwrap();
        let counts = Recorder::new();
        store.subscribe_selector(
            |state: &State| state.get::<i64>("count").copied().unwrap_or_default(),
            counts.listener(),
        );

        store.dispatch(CounterAction::Increment).unwrap();
        store.dispatch(CounterAction::Unknown).unwrap();
        store.dispatch(CounterAction::Add(2)).unwrap();

        assert_eq!(counts.values(), vec![1, 3]);
        assert_eq!(counts.last(), Some(3));
        assert_eq!(counts.count(), 2);
    }

    #[tokio::test]
    async fn test_latch_waits_for_spawned_dispatches() {
        let store = Store::<CounterAction>::builder()
            .with_slice("count", 0i64, counter)
            .build()
            .unwrap();
        let cycles = NotificationLatch::expecting(2);
        store.subscribe(cycles.listener());

        store.spawn_dispatch(async { CounterAction::Increment });
        store.spawn_dispatch(async { CounterAction::Add(10) });

        tokio::time::timeout(Duration::from_secs(5), cycles.wait())
            .await
            .unwrap();
        assert_eq!(cycles.pending(), 0);
        assert_eq!(store.get_state().get::<i64>("count"), Some(&11));
    }

    #[test]
    #[should_panic(expected = "more notifications than the latch expected")]
    fn test_latch_rejects_unplanned_notifications() {
        let cycles = NotificationLatch::expecting(1);
        cycles.count_notification();
        cycles.count_notification();
    }
}
