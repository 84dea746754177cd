//! Subscriber registry and change propagation.
//!
//! Subscribers observe applied transitions. They cannot change state
//! directly; a listener that wants a follow-up transition dispatches a new
//! action, which the store queues behind the current notification pass.
//!
//! # Subscriber Kinds
//!
//! | Kind     | Fires when                                             |
//! |----------|--------------------------------------------------------|
//! | Plain    | every applied transition                               |
//! | Selector | the derived value differs under its [`Equality`] policy |
//!
//! # Guarantees
//!
//! - **At most once per cycle**: each subscriber is visited once per applied
//!   transition, however many slices changed
//! - **Registration order**: subscribers are visited in the order they were
//!   registered
//! - **Isolation**: a failing or panicking listener never stops the pass;
//!   its error is collected and reported with the dispatch
//!
//! Subscribers registered during a pass first fire on the next cycle.
//! Subscribers removed during a pass are skipped for the rest of it.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::core::State;
use crate::error::{extract_panic_message, SubscriberNotificationError};
use crate::memo::Equality;

/// Identity of a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl SubscriberId {
    /// Get the inner value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

// =============================================================================
// Subscriber Kinds (Type-Erased)
// =============================================================================

/// Type-erased subscriber for internal use.
pub(crate) trait AnySubscriber: Send + Sync {
    /// Deliver a transition. Returns `Ok(true)` if the listener ran.
    fn deliver(&self, previous: &State, next: &State) -> Result<bool>;
}

struct PlainSubscriber<L> {
    listener: L,
}

impl<L> AnySubscriber for PlainSubscriber<L>
where
    L: Fn(&State) -> Result<()> + Send + Sync,
{
    fn deliver(&self, _previous: &State, next: &State) -> Result<bool> {
        (self.listener)(next)?;
        Ok(true)
    }
}

struct SelectorSubscriber<T, S, L> {
    selector: S,
    equality: Equality<T>,
    last: Mutex<T>,
    listener: L,
}

impl<T, S, L> AnySubscriber for SelectorSubscriber<T, S, L>
where
    T: Clone + Send + 'static,
    S: Fn(&State) -> T + Send + Sync,
    L: Fn(&T) -> Result<()> + Send + Sync,
{
    fn deliver(&self, _previous: &State, next: &State) -> Result<bool> {
        let derived = (self.selector)(next);
        let changed = {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            let changed = !self.equality.eq(&last, &derived);
            *last = derived.clone();
            changed
        };

        if !changed {
            return Ok(false);
        }
        (self.listener)(&derived)?;
        Ok(true)
    }
}

/// Build a subscriber that fires on every applied transition.
pub(crate) fn plain<L>(listener: L) -> Box<dyn AnySubscriber>
where
    L: Fn(&State) -> Result<()> + Send + Sync + 'static,
{
    Box::new(PlainSubscriber { listener })
}

/// Build a selector-gated subscriber seeded with the current derived value.
pub(crate) fn selector<T, S, L>(
    current: &State,
    selector: S,
    equality: Equality<T>,
    listener: L,
) -> Box<dyn AnySubscriber>
where
    T: Clone + Send + 'static,
    S: Fn(&State) -> T + Send + Sync + 'static,
    L: Fn(&T) -> Result<()> + Send + Sync + 'static,
{
    let seed = selector(current);
    Box::new(SelectorSubscriber {
        selector,
        equality,
        last: Mutex::new(seed),
        listener,
    })
}

// =============================================================================
// Registry
// =============================================================================

struct SubscriberEntry {
    id: SubscriberId,
    label: Option<&'static str>,
    active: AtomicBool,
    inner: Box<dyn AnySubscriber>,
}

/// Result of one notification pass.
#[derive(Debug, Default)]
pub(crate) struct NotifyOutcome {
    pub notified: usize,
    pub failures: Vec<SubscriberNotificationError>,
}

/// Ordered set of subscribers.
///
/// Ids are monotonic, so iteration order is registration order.
pub struct SubscriberRegistry {
    entries: Mutex<BTreeMap<SubscriberId, Arc<SubscriberEntry>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Acquire the entries lock, recovering from poison if necessary.
    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<SubscriberId, Arc<SubscriberEntry>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(
        &self,
        label: Option<&'static str>,
        inner: Box<dyn AnySubscriber>,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(SubscriberEntry {
            id,
            label,
            active: AtomicBool::new(true),
            inner,
        });
        self.lock_entries().insert(id, entry);
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn remove(&self, id: SubscriberId) -> bool {
        match self.lock_entries().remove(&id) {
            Some(entry) => {
                entry.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Check whether a subscriber is registered.
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock_entries().contains_key(&id)
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Check if no subscribers are registered.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Deregister everything. Returns how many subscribers were removed.
    pub(crate) fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock_entries());
        for entry in drained.values() {
            entry.active.store(false, Ordering::Release);
        }
        drained.len()
    }

    /// Visit every subscriber once for the `previous -> next` transition.
    pub(crate) fn notify(&self, previous: &State, next: &State, catch_panics: bool) -> NotifyOutcome {
        // Snapshot so listeners may (un)subscribe without deadlocking.
        let entries: Vec<Arc<SubscriberEntry>> = self.lock_entries().values().cloned().collect();
        let mut outcome = NotifyOutcome::default();

        for entry in entries {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }

            let result = if catch_panics {
                catch_unwind(AssertUnwindSafe(|| entry.inner.deliver(previous, next)))
                    .unwrap_or_else(|panic_info| {
                        Err(anyhow!(
                            "subscriber panicked: {}",
                            extract_panic_message(&panic_info)
                        ))
                    })
            } else {
                entry.inner.deliver(previous, next)
            };

            match result {
                Ok(true) => outcome.notified += 1,
                Ok(false) => {}
                Err(source) => {
                    warn!(
                        subscriber = %entry.id,
                        label = entry.label.unwrap_or("-"),
                        revision = %next.revision(),
                        error = %source,
                        "subscriber failed"
                    );
                    outcome.failures.push(SubscriberNotificationError {
                        subscriber: entry.id,
                        label: entry.label,
                        revision: next.revision(),
                        source,
                    });
                }
            }
        }

        outcome
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscriber_count", &self.len())
            .finish()
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Handle returned by `subscribe`, used to unsubscribe later.
///
/// The handle only holds a weak reference to the registry: it never keeps a
/// store alive, and dropping it does **not** unsubscribe. Subscribers live
/// until [`Subscription::unsubscribe`] or store teardown.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriberId,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, registry: &Arc<SubscriberRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// The subscriber's identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove the subscriber.
    ///
    /// Returns false if it was already removed or the store is gone.
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.remove(self.id))
            .unwrap_or(false)
    }

    /// Check whether the subscriber is still registered.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.contains(self.id))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
