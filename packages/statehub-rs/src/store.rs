//! The store: a single-writer dispatch pipeline over the reducer engine.
//!
//! # Architecture
//!
//! ```text
//! dispatch(action)
//!     │
//!     ▼
//! Pipeline ──draining on this thread?──► enqueue, return Queued
//!     │
//!     ├──draining on another thread?──► wait until idle
//!     │
//!     ▼ (this caller owns the drain)
//! ReducerEngine::reduce ──same snapshot?──► Unchanged
//!     │
//!     ▼
//! install snapshot ─► watch channel
//!     │
//!     ▼
//! SubscriberRegistry::notify ─► listeners (may dispatch: queued)
//!     │
//!     ▼
//! drain queue FIFO, then return Dispatched
//! ```
//!
//! # Key Properties
//!
//! - **One transition at a time**: the caller that starts a drain processes
//!   every action its own listeners dispatch, in arrival order. Callers on
//!   other threads wait for the drain to finish and then run their own, so
//!   they always receive their own action's outcome
//! - **Atomic**: a failing reducer leaves the store on its last good state
//! - **Readers never block writers for long**: `get_state` clones an `Arc`
//!   under a short read lock

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use anyhow::Result as AnyResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{TransitionLog, TransitionOutcome, TransitionRecord};
use crate::config::StoreConfig;
use crate::core::{Action, Revision, SliceKey, State};
use crate::error::{StoreError, SubscriberNotificationError};
use crate::memo::{Equality, MemoCache};
use crate::reducer::{Reducer, ReducerEngine};
use crate::subscription::{self, SubscriberId, SubscriberRegistry, Subscription};

// =============================================================================
// Dispatch Report
// =============================================================================

/// What happened to a dispatched action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The action produced a new snapshot and subscribers were notified.
    Applied,
    /// Every reducer returned its input; nothing was notified.
    Unchanged,
    /// Dispatched from a listener during a drain; the draining call will
    /// process it once the current notification pass ends.
    Queued,
}

/// Report returned by [`Store::dispatch`].
#[derive(Debug)]
pub struct Dispatched {
    /// Outcome of this call's own action.
    pub status: DispatchStatus,
    /// Revision after this call's own action.
    pub revision: Revision,
    /// Subscribers that fired for this call's own action.
    pub notified: usize,
    /// Subscriber failures from every cycle drained by this call.
    pub failures: Vec<SubscriberNotificationError>,
    /// Errors of actions that listeners queued during this call.
    pub deferred: Vec<StoreError>,
}

impl Dispatched {
    fn queued(revision: Revision) -> Self {
        Self {
            status: DispatchStatus::Queued,
            revision,
            notified: 0,
            failures: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Returns true if this call's action installed a new snapshot.
    pub fn is_applied(&self) -> bool {
        self.status == DispatchStatus::Applied
    }

    /// Returns true if the action was handed to an in-progress drain.
    pub fn is_queued(&self) -> bool {
        self.status == DispatchStatus::Queued
    }

    /// Turn collected subscriber failures into an error.
    pub fn into_result(self) -> Result<Self, StoreError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(StoreError::SubscriberNotification(self.failures))
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

enum Command<A> {
    Dispatch(A),
    Reset,
}

impl<A: Action> Command<A> {
    fn kind(&self) -> String {
        match self {
            Command::Dispatch(action) => action.kind().into_owned(),
            Command::Reset => "reset".to_string(),
        }
    }
}

struct Pipeline<A> {
    /// Commands dispatched re-entrantly by the drainer's own listeners.
    queue: VecDeque<Command<A>>,
    /// Thread running the current drain.
    drainer: Option<ThreadId>,
    /// Commands accepted by the current drain, including its first.
    accepted: usize,
}

impl<A> Pipeline<A> {
    fn release(&mut self) {
        self.drainer = None;
        self.accepted = 0;
    }
}

/// Result of processing one command.
struct Cycle {
    status: DispatchStatus,
    revision: Revision,
    notified: usize,
    failures: Vec<SubscriberNotificationError>,
}

/// Releases the pipeline if a drain unwinds.
struct DrainGuard<'a, A> {
    inner: &'a StoreInner<A>,
    armed: bool,
}

impl<A> DrainGuard<'_, A> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<A> Drop for DrainGuard<'_, A> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let dropped = {
            let mut pipeline = self.inner.lock_pipeline();
            let dropped = pipeline.queue.len();
            pipeline.queue.clear();
            pipeline.release();
            dropped
        };
        self.inner.idle.notify_all();
        warn!(dropped, "dispatch drain unwound, queued actions discarded");
    }
}

struct StoreInner<A> {
    engine: ReducerEngine<A>,
    current: RwLock<State>,
    pipeline: Mutex<Pipeline<A>>,
    /// Signalled whenever a drain finishes.
    idle: Condvar,
    registry: Arc<SubscriberRegistry>,
    memo: MemoCache,
    log: TransitionLog,
    config: StoreConfig,
    watch_tx: watch::Sender<State>,
}

impl<A> StoreInner<A> {
    fn lock_pipeline(&self) -> MutexGuard<'_, Pipeline<A>> {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self) -> State {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn install(&self, next: State) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        self.watch_tx.send_replace(next);
    }
}

// =============================================================================
// Store
// =============================================================================

/// A reducer-driven state container.
///
/// `Store` is a cheap handle; clones share the same state, subscribers and
/// pipeline.
///
/// # Example
///
/// ```ignore
/// let store = Store::builder()
///     .with_slice("count", 0i64, counter_reducer)
///     .build()?;
///
/// store.subscribe(|state| {
///     println!("count is now {:?}", state.get::<i64>("count"));
///     Ok(())
/// });
///
/// store.dispatch(CounterAction::Increment)?;
/// ```
pub struct Store<A> {
    inner: Arc<StoreInner<A>>,
}

impl<A> Clone for Store<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Action> Store<A> {
    /// Start building a store.
    pub fn builder() -> StoreBuilder<A> {
        StoreBuilder::new()
    }

    /// Dispatch an action.
    ///
    /// The action is reduced, installed and notified on this thread, followed
    /// by every action this call's listeners dispatched meanwhile.
    ///
    /// A listener dispatching during that pass gets `DispatchStatus::Queued`.
    /// A caller on another thread blocks until the running drain finishes and
    /// then processes its own action, so its reducer errors are returned to it.
    ///
    /// A listener must not wait on another thread that dispatches to the same
    /// store: that thread waits for this drain, which waits for the listener.
    pub fn dispatch(&self, action: A) -> Result<Dispatched, StoreError> {
        self.submit(Command::Dispatch(action))
    }

    /// Return every slice to its registered initial value.
    ///
    /// This is a regular transition: it gets a new revision, is recorded and
    /// notifies subscribers. A store already holding its initial values is
    /// left untouched and reports `DispatchStatus::Unchanged`.
    pub fn reset(&self) -> Result<Dispatched, StoreError> {
        self.submit(Command::Reset)
    }

    fn submit(&self, command: Command<A>) -> Result<Dispatched, StoreError> {
        let me = thread::current().id();
        {
            let mut pipeline = self.inner.lock_pipeline();
            if pipeline.drainer == Some(me) {
                let limit = self.inner.config.max_queue_depth;
                if pipeline.accepted >= limit {
                    error!(
                        store = %self.inner.config.name,
                        action = %command.kind(),
                        limit,
                        "dispatch overflow, action dropped"
                    );
                    return Err(StoreError::DispatchOverflow { limit });
                }
                pipeline.accepted += 1;
                debug!(
                    store = %self.inner.config.name,
                    action = %command.kind(),
                    depth = pipeline.queue.len() + 1,
                    "dispatch in progress, action queued"
                );
                pipeline.queue.push_back(command);
                return Ok(Dispatched::queued(self.inner.current().revision()));
            }
            if pipeline.drainer.is_some() {
                debug!(
                    store = %self.inner.config.name,
                    action = %command.kind(),
                    "dispatch in progress on another thread, waiting"
                );
                while pipeline.drainer.is_some() {
                    pipeline = self
                        .inner
                        .idle
                        .wait(pipeline)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
            pipeline.drainer = Some(me);
            pipeline.accepted = 1;
        }

        let mut guard = DrainGuard {
            inner: &*self.inner,
            armed: true,
        };

        let first = self.process(command);
        let mut failures = Vec::new();
        let mut deferred = Vec::new();

        loop {
            let next = {
                let mut pipeline = self.inner.lock_pipeline();
                match pipeline.queue.pop_front() {
                    Some(command) => command,
                    None => {
                        pipeline.release();
                        break;
                    }
                }
            };
            match self.process(next) {
                Ok(cycle) => failures.extend(cycle.failures),
                Err(e) => deferred.push(e),
            }
        }
        guard.disarm();
        self.inner.idle.notify_one();

        let cycle = first?;
        let mut all_failures = cycle.failures;
        all_failures.extend(failures);

        Ok(Dispatched {
            status: cycle.status,
            revision: cycle.revision,
            notified: cycle.notified,
            failures: all_failures,
            deferred,
        })
    }

    /// Reduce, install, notify and record one command.
    fn process(&self, command: Command<A>) -> Result<Cycle, StoreError> {
        let inner = &self.inner;
        let previous = inner.current();
        let kind = command.kind();

        let reduced = match &command {
            Command::Dispatch(action) => inner.engine.reduce_tracked(&previous, action),
            Command::Reset => {
                let next = previous.succeeded_by(inner.engine.initial_slices());
                let changed: Vec<SliceKey> = inner
                    .engine
                    .slice_keys()
                    .filter(|key| !State::slice_unchanged(&previous, &next, key.as_str()))
                    .cloned()
                    .collect();
                if changed.is_empty() {
                    // Already at the initial values
                    Ok((previous.clone(), changed))
                } else {
                    Ok((next, changed))
                }
            }
        };

        let (next, changed) = match reduced {
            Ok(reduced) => reduced,
            Err(err) => {
                error!(
                    store = %inner.config.name,
                    action = %kind,
                    revision = %previous.revision(),
                    error = %err,
                    "reducer failed, dispatch rolled back"
                );
                inner.log.record(TransitionRecord::new(
                    previous.revision(),
                    kind,
                    TransitionOutcome::Rejected {
                        error: err.to_string(),
                    },
                ));
                return Err(err);
            }
        };

        if State::ptr_eq(&previous, &next) {
            debug!(
                store = %inner.config.name,
                action = %kind,
                revision = %previous.revision(),
                "action changed nothing"
            );
            inner.log.record(TransitionRecord::new(
                previous.revision(),
                kind,
                TransitionOutcome::Unchanged,
            ));
            return Ok(Cycle {
                status: DispatchStatus::Unchanged,
                revision: previous.revision(),
                notified: 0,
                failures: Vec::new(),
            });
        }

        inner.install(next.clone());
        debug!(
            store = %inner.config.name,
            action = %kind,
            revision = %next.revision(),
            changed = changed.len(),
            "applied transition"
        );

        let outcome = inner
            .registry
            .notify(&previous, &next, inner.config.catch_panics);

        let record = match command {
            Command::Reset => TransitionRecord::new(next.revision(), kind, TransitionOutcome::Reset),
            Command::Dispatch(_) => TransitionRecord::applied(next.revision(), kind, &changed),
        };
        inner
            .log
            .record(record.with_notification(outcome.notified, outcome.failures.len()));

        Ok(Cycle {
            status: DispatchStatus::Applied,
            revision: next.revision(),
            notified: outcome.notified,
            failures: outcome.failures,
        })
    }

    /// Spawn a task that awaits `producer` and dispatches the action it yields.
    ///
    /// Aborting the returned handle before the producer finishes cancels the
    /// dispatch. Must be called from within a tokio runtime. The final
    /// dispatch is synchronous and may briefly wait for a drain running on
    /// another thread.
    ///
    /// # Example
    ///
    /// ```ignore
    /// store.dispatch(FetchAction::Started)?;
    /// let handle = store.spawn_dispatch(async move {
    ///     match client.get_post(1).await {
    ///         Ok(post) => FetchAction::Succeeded(post),
    ///         Err(e) => FetchAction::Failed(e.to_string()),
    ///     }
    /// });
    /// // On unmount / navigation:
    /// handle.abort();
    /// ```
    pub fn spawn_dispatch<F>(&self, producer: F) -> JoinHandle<Result<Dispatched, StoreError>>
    where
        F: Future<Output = A> + Send + 'static,
    {
        let store = self.clone();
        tokio::spawn(async move {
            let action = producer.await;
            store.dispatch(action)
        })
    }
}

impl<A> Store<A> {
    /// The current snapshot.
    ///
    /// Never observes a partially applied transition.
    pub fn get_state(&self) -> State {
        self.inner.current()
    }

    /// Revision of the current snapshot.
    pub fn revision(&self) -> Revision {
        self.inner.current().revision()
    }

    /// Subscribe to every applied transition.
    pub fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn(&State) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.register(None, subscription::plain(listener))
    }

    /// Subscribe with a label that appears in failure reports and logs.
    pub fn subscribe_labeled<L>(&self, label: &'static str, listener: L) -> Subscription
    where
        L: Fn(&State) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.register(Some(label), subscription::plain(listener))
    }

    /// Subscribe to a derived value, firing only when it changes.
    ///
    /// The selector runs once now to seed the comparison, then on every
    /// applied transition.
    pub fn subscribe_selector<T, S, L>(&self, selector: S, listener: L) -> Subscription
    where
        T: Clone + PartialEq + Send + 'static,
        S: Fn(&State) -> T + Send + Sync + 'static,
        L: Fn(&T) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.subscribe_selector_with(selector, Equality::value(), listener)
    }

    /// Like [`Store::subscribe_selector`] with a custom equality policy.
    pub fn subscribe_selector_with<T, S, L>(
        &self,
        selector: S,
        equality: Equality<T>,
        listener: L,
    ) -> Subscription
    where
        T: Clone + Send + 'static,
        S: Fn(&State) -> T + Send + Sync + 'static,
        L: Fn(&T) -> AnyResult<()> + Send + Sync + 'static,
    {
        let current = self.inner.current();
        self.register(
            None,
            subscription::selector(&current, selector, equality, listener),
        )
    }

    fn register(
        &self,
        label: Option<&'static str>,
        subscriber: Box<dyn subscription::AnySubscriber>,
    ) -> Subscription {
        let id = self.inner.registry.insert(label, subscriber);
        debug!(store = %self.inner.config.name, subscriber = %id, label = label.unwrap_or("-"), "subscribed");
        Subscription::new(id, &self.inner.registry)
    }

    /// Remove a subscriber by id. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.registry.remove(id)
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Receive every applied snapshot asynchronously.
    ///
    /// The receiver starts at the current snapshot; intermediate snapshots
    /// may be skipped by a slow receiver.
    pub fn watch(&self) -> watch::Receiver<State> {
        self.inner.watch_tx.subscribe()
    }

    /// The store-owned memo cache.
    pub fn memo(&self) -> &MemoCache {
        &self.inner.memo
    }

    /// The transition log.
    pub fn transitions(&self) -> &TransitionLog {
        &self.inner.log
    }

    /// The configuration the store was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Deregister all subscribers, discard memo entries and clear the log.
    ///
    /// The state itself stays readable. Listeners holding a store handle
    /// keep the store alive until they are removed here.
    pub fn teardown(&self) {
        let removed = self.inner.registry.clear();
        let memos = self.inner.memo.len();
        self.inner.memo.clear();
        self.inner.log.clear();
        info!(
            store = %self.inner.config.name,
            subscribers = removed,
            memos,
            "store torn down"
        );
    }
}

impl<A> fmt::Debug for Store<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.config.name)
            .field("revision", &self.revision())
            .field("engine", &self.inner.engine)
            .field("subscribers", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Store`].
///
/// # Example
///
/// ```ignore
/// let store = StoreBuilder::new()
///     .with_config(StoreConfig::from_env()?)
///     .with_slice("count", 0i64, counter_reducer)
///     .with_slice("post", FetchState::<Post>::loading(), FetchReducer::direct())
///     .build()?;
/// ```
pub struct StoreBuilder<A> {
    engine: ReducerEngine<A>,
    config: StoreConfig,
}

impl<A: Action> StoreBuilder<A> {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            engine: ReducerEngine::new(),
            config: StoreConfig::default(),
        }
    }

    /// Use the given configuration.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a slice reducer.
    ///
    /// # Panics
    ///
    /// Panics if the slice key is already registered. Use
    /// [`StoreBuilder::try_with_slice`] to handle that as an error.
    pub fn with_slice<S, R>(self, key: impl Into<SliceKey>, initial: S, reducer: R) -> Self
    where
        S: Send + Sync + 'static,
        R: Reducer<A, S>,
    {
        match self.try_with_slice(key, initial, reducer) {
            Ok(builder) => builder,
            Err(e) => panic!("{}", e),
        }
    }

    /// Register a slice reducer, returning an error on duplicate keys.
    pub fn try_with_slice<S, R>(
        mut self,
        key: impl Into<SliceKey>,
        initial: S,
        reducer: R,
    ) -> Result<Self, StoreError>
    where
        S: Send + Sync + 'static,
        R: Reducer<A, S>,
    {
        self.engine.register(key, initial, reducer)?;
        Ok(self)
    }

    /// Validate the configuration and build the store at revision 0.
    pub fn build(mut self) -> Result<Store<A>, StoreError> {
        self.config.validate()?;
        self.engine.set_catch_panics(self.config.catch_panics);

        let initial = self.engine.initial_state();
        let (watch_tx, _) = watch::channel(initial.clone());

        info!(
            store = %self.config.name,
            slices = self.engine.len(),
            max_queue_depth = self.config.max_queue_depth,
            "store built"
        );

        Ok(Store {
            inner: Arc::new(StoreInner {
                engine: self.engine,
                current: RwLock::new(initial),
                pipeline: Mutex::new(Pipeline {
                    queue: VecDeque::new(),
                    drainer: None,
                    accepted: 0,
                }),
                idle: Condvar::new(),
                registry: Arc::new(SubscriberRegistry::new()),
                memo: MemoCache::new(),
                log: TransitionLog::new(self.config.history_limit),
                config: self.config,
                watch_tx,
            }),
        })
    }
}

impl<A: Action> Default for StoreBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::pure_reducer;
    use anyhow::anyhow;
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum CounterAction {
        Increment,
        Add(i64),
        Rename(&'static str),
        Divide(i64),
        Unknown,
    }

    impl Action for CounterAction {
        fn kind(&self) -> Cow<'_, str> {
            match self {
                CounterAction::Increment => "increment".into(),
                CounterAction::Add(_) => "add".into(),
                CounterAction::Rename(_) => "rename".into(),
                CounterAction::Divide(_) => "divide".into(),
                CounterAction::Unknown => "unknown".into(),
            }
        }
    }

    fn counter(state: &Arc<i64>, action: &CounterAction) -> AnyResult<Arc<i64>> {
        match action {
            CounterAction::Increment => Ok(Arc::new(**state + 1)),
            CounterAction::Add(n) => Ok(Arc::new(**state + n)),
            CounterAction::Divide(0) => Err(anyhow!("division by zero")),
            CounterAction::Divide(n) => Ok(Arc::new(**state / n)),
            _ => Ok(Arc::clone(state)),
        }
    }

    fn store() -> Store<CounterAction> {
        Store::<CounterAction>::builder()
            .with_slice("count", 0i64, counter)
            .with_slice(
                "name",
                String::from("anon"),
                pure_reducer(|name: &String, action: &CounterAction| match action {
                    CounterAction::Rename(to) if name != to => Some(to.to_string()),
                    _ => None,
                }),
            )
            .build()
            .unwrap()
    }

    fn count(state: &State) -> i64 {
        state.get::<i64>("count").copied().unwrap_or_default()
    }

    fn counting_listener(store: &Store<CounterAction>) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = calls.clone();
        store.subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        calls
    }

    #[test]
    fn test_counter_scenario() {
        let store = Store::<CounterAction>::builder()
            .with_slice("count", 0i64, counter)
            .build()
            .unwrap();
        let calls = counting_listener(&store);

        // Dispatches one more increment the first time it is notified
        let handle = store.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let nested = Arc::new(Mutex::new(Vec::new()));
        let nested_sink = nested.clone();
        store.subscribe(move |_| {
            if !fired.swap(true, Ordering::SeqCst) {
                let report = handle.dispatch(CounterAction::Increment)?;
                nested_sink.lock().unwrap().push((report.status, count(&handle.get_state())));
            }
            Ok(())
        });

        let report = store.dispatch(CounterAction::Increment).unwrap();
        assert!(report.is_applied());
        assert_eq!(report.revision, Revision(1));
        // The nested increment was queued while count was still 1
        assert_eq!(*nested.lock().unwrap(), vec![(DispatchStatus::Queued, 1)]);
        assert_eq!(count(&store.get_state()), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let before = store.get_state();
        let report = store.dispatch(CounterAction::Unknown).unwrap();
        assert_eq!(report.status, DispatchStatus::Unchanged);
        assert!(State::ptr_eq(&before, &store.get_state()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(count(&store.get_state()), 2);

        store.teardown();
    }

    #[test]
    fn test_listener_dispatch_runs_after_notification_pass() {
        let store = store();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handle = store.clone();
        let sink = order.clone();
        store.subscribe(move |state| {
            sink.lock().unwrap().push(format!("first:{}", count(state)));
            if count(state) == 1 {
                handle.dispatch(CounterAction::Increment)?;
            }
            Ok(())
        });
        let sink = order.clone();
        store.subscribe(move |state| {
            sink.lock().unwrap().push(format!("second:{}", count(state)));
            Ok(())
        });

        store.dispatch(CounterAction::Increment).unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first:1", "second:1", "first:2", "second:2"]
        );
        store.teardown();
    }

    #[test]
    fn test_unknown_action_keeps_snapshot_reference() {
        let store = store();
        let before = store.get_state();

        store.dispatch(CounterAction::Unknown).unwrap();

        assert!(State::ptr_eq(&before, &store.get_state()));
        assert_eq!(store.transitions().unchanged().len(), 1);
    }

    #[test]
    fn test_reducer_failure_is_atomic() {
        let store = store();
        store.dispatch(CounterAction::Add(10)).unwrap();
        store.dispatch(CounterAction::Rename("ada")).unwrap();
        let before = store.get_state();
        let calls = counting_listener(&store);

        let err = store.dispatch(CounterAction::Divide(0)).unwrap_err();

        assert!(err.is_rollback());
        assert!(State::ptr_eq(&before, &store.get_state()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.transitions().rejected().len(), 1);

        // The store keeps working after a rejected dispatch
        store.dispatch(CounterAction::Divide(2)).unwrap();
        assert_eq!(count(&store.get_state()), 5);
    }

    #[test]
    fn test_subscriber_fires_once_when_many_slices_change() {
        let mut builder = Store::<CounterAction>::builder();
        for key in ["a", "b", "c"] {
            builder = builder.with_slice(key, 0i64, counter);
        }
        let store = builder.build().unwrap();
        let calls = counting_listener(&store);

        let report = store.dispatch(CounterAction::Increment).unwrap();

        assert_eq!(report.notified, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match &store.transitions().recent(1)[0].outcome {
            TransitionOutcome::Applied { changed_slices } => {
                assert_eq!(changed_slices, &vec!["a", "b", "c"])
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_selector_only_fires_on_derived_change() {
        let store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe_selector(count, move |value: &i64| {
            sink.lock().unwrap().push(*value);
            Ok(())
        });

        store.dispatch(CounterAction::Rename("ada")).unwrap();
        store.dispatch(CounterAction::Increment).unwrap();
        store.dispatch(CounterAction::Rename("bob")).unwrap();
        store.dispatch(CounterAction::Add(2)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_selector_with_custom_equality() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = calls.clone();
        // Only parity matters
        store.subscribe_selector_with(
            count,
            Equality::new(|a: &i64, b: &i64| a % 2 == b % 2),
            move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        store.dispatch(CounterAction::Add(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        store.dispatch(CounterAction::Increment).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscriber_failures_are_reported() {
        let store = store();
        store.subscribe_labeled("broken", |_| Err(anyhow!("render failed")));
        let calls = counting_listener(&store);

        let report = store.dispatch(CounterAction::Increment).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].label, Some("broken"));
        assert_eq!(report.failures[0].revision, Revision(1));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, StoreError::SubscriberNotification(ref f) if f.len() == 1));
        // The transition itself still applied
        assert_eq!(count(&store.get_state()), 1);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = calls.clone();
        let subscription = store.subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        store.dispatch(CounterAction::Increment).unwrap();
        assert!(store.unsubscribe(subscription.id()));
        assert!(!subscription.is_active());
        store.dispatch(CounterAction::Increment).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_does_not_unsubscribe() {
        let store = store();
        let calls = counting_listener(&store);

        store.dispatch(CounterAction::Increment).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 1);
    }

    #[test]
    fn test_dispatch_loop_overflows() {
        let store = Store::<CounterAction>::builder()
            .with_config(StoreConfig::default().with_max_queue_depth(4))
            .with_slice("count", 0i64, counter)
            .build()
            .unwrap();

        let overflow = Arc::new(Mutex::new(None));
        let handle = store.clone();
        let sink = overflow.clone();
        store.subscribe(move |_| {
            if let Err(e) = handle.dispatch(CounterAction::Increment) {
                *sink.lock().unwrap() = Some(e.to_string());
            }
            Ok(())
        });

        store.dispatch(CounterAction::Increment).unwrap();

        // First action plus three queued ones fit within the bound
        assert_eq!(count(&store.get_state()), 4);
        assert!(overflow.lock().unwrap().as_deref().unwrap().contains("overflow"));

        // The pipeline is usable again afterwards
        store.teardown();
        store.dispatch(CounterAction::Increment).unwrap();
        assert_eq!(count(&store.get_state()), 5);
    }

    #[test]
    fn test_queued_reducer_errors_are_deferred() {
        let store = store();
        let handle = store.clone();
        store.subscribe(move |state| {
            if count(state) == 1 {
                handle.dispatch(CounterAction::Divide(0))?;
            }
            Ok(())
        });

        let report = store.dispatch(CounterAction::Increment).unwrap();

        assert!(report.is_applied());
        assert_eq!(report.deferred.len(), 1);
        assert!(report.deferred[0].is_rollback());
        assert_eq!(count(&store.get_state()), 1);
        store.teardown();
    }

    #[test]
    fn test_reset_restores_initial_values() {
        let store = store();
        store.dispatch(CounterAction::Add(7)).unwrap();
        store.dispatch(CounterAction::Rename("ada")).unwrap();
        let calls = counting_listener(&store);

        let report = store.reset().unwrap();

        assert!(report.is_applied());
        assert_eq!(report.revision, Revision(3));
        assert_eq!(count(&store.get_state()), 0);
        assert_eq!(
            store.get_state().get::<String>("name").map(String::as_str),
            Some("anon")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.transitions().recent(1)[0].outcome,
            TransitionOutcome::Reset
        );
    }

    #[test]
    fn test_reset_at_initial_values_is_a_noop() {
        let store = store();
        let calls = counting_listener(&store);
        let before = store.get_state();

        let report = store.reset().unwrap();

        assert_eq!(report.status, DispatchStatus::Unchanged);
        assert_eq!(report.revision, Revision::INITIAL);
        assert!(State::ptr_eq(&before, &store.get_state()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Back at the initial values after a change: reset twice, notify once
        store.dispatch(CounterAction::Add(2)).unwrap();
        assert!(store.reset().unwrap().is_applied());
        assert_eq!(store.reset().unwrap().status, DispatchStatus::Unchanged);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reducer_error_reaches_caller_on_another_thread() {
        let store = store();
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        // Hold the first drain open inside a listener
        let parked = Arc::new(AtomicBool::new(false));
        let (gate_in, gate_out) = (entered.clone(), release.clone());
        store.subscribe(move |_| {
            if !parked.swap(true, Ordering::SeqCst) {
                gate_in.wait();
                gate_out.wait();
            }
            Ok(())
        });

        let draining = {
            let store = store.clone();
            std::thread::spawn(move || store.dispatch(CounterAction::Increment))
        };
        entered.wait();

        let failing = {
            let store = store.clone();
            std::thread::spawn(move || store.dispatch(CounterAction::Divide(0)))
        };
        std::thread::sleep(Duration::from_millis(20));
        release.wait();

        let first = draining.join().unwrap().unwrap();
        assert!(first.is_applied());
        assert!(first.deferred.is_empty());

        let err = failing.join().unwrap().unwrap_err();
        assert!(err.is_rollback());
        assert_eq!(count(&store.get_state()), 1);
        store.teardown();
    }

    #[test]
    fn test_contention_without_loop_never_overflows() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;

        let store = Store::<CounterAction>::builder()
            .with_config(StoreConfig::default().with_max_queue_depth(4))
            .with_slice("count", 0i64, counter)
            .build()
            .unwrap();
        // Slow, and never dispatches
        store.subscribe(|_| {
            std::thread::sleep(Duration::from_micros(200));
            Ok(())
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| store.dispatch(CounterAction::Increment))
                        .filter(|result| !matches!(result, Ok(r) if r.is_applied()))
                        .count()
                })
            })
            .collect();
        let rejected: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(rejected, 0);
        assert_eq!(count(&store.get_state()), (THREADS * PER_THREAD) as i64);
    }

    #[test]
    fn test_duplicate_slice_in_builder() {
        let result = Store::<CounterAction>::builder()
            .with_slice("count", 0i64, counter)
            .try_with_slice("count", 1i64, counter);

        assert!(matches!(result, Err(StoreError::DuplicateSlice { .. })));
    }

    #[test]
    #[should_panic(expected = "slice already registered")]
    fn test_with_slice_panics_on_duplicate() {
        let _ = Store::<CounterAction>::builder()
            .with_slice("count", 0i64, counter)
            .with_slice("count", 1i64, counter);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Store::<CounterAction>::builder()
            .with_config(StoreConfig::default().with_max_queue_depth(0))
            .build();
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_teardown_clears_everything() {
        let store = store();
        let calls = counting_listener(&store);
        store.memo().memo_keyed("doubled", 2i64, || 4i64);
        store.dispatch(CounterAction::Increment).unwrap();

        store.teardown();

        assert_eq!(store.subscriber_count(), 0);
        assert!(store.memo().is_empty());
        assert!(store.transitions().is_empty());
        store.dispatch(CounterAction::Increment).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(count(&store.get_state()), 2);
    }

    #[tokio::test]
    async fn test_watch_receives_applied_snapshots() {
        let store = store();
        let mut rx = store.watch();
        assert_eq!(rx.borrow().revision(), Revision::INITIAL);

        store.dispatch(CounterAction::Add(3)).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(count(&rx.borrow_and_update()), 3);
    }

    #[tokio::test]
    async fn test_spawn_dispatch_applies_produced_action() {
        let store = store();

        let report = store
            .spawn_dispatch(async { CounterAction::Add(4) })
            .await
            .unwrap()
            .unwrap();

        assert!(report.is_applied());
        assert_eq!(count(&store.get_state()), 4);
    }

    #[tokio::test]
    async fn test_aborted_producer_never_dispatches() {
        let store = store();

        let handle = store.spawn_dispatch(std::future::pending::<CounterAction>());
        handle.abort();

        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(store.revision(), Revision::INITIAL);
    }
}
