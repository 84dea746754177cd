//! Memoization of derived values keyed by dependency lists.
//!
//! A [`Memo`] cell caches the last value it computed together with the
//! dependencies used to compute it. Calling it again with equal dependencies
//! returns the cached value; anything else recomputes.
//!
//! # Equality
//!
//! "Equal" is decided by an [`Equality`] policy chosen per memo site:
//!
//! | Policy                     | Compares                                 |
//! |----------------------------|------------------------------------------|
//! | `Equality::value()`        | `PartialEq` (default)                    |
//! | `Equality::pointer()`      | `Arc::ptr_eq` on `Arc<U>` deps           |
//! | `Equality::elementwise(p)` | sequences position-wise, slot policy `p` |
//! | `Equality::new(f)`         | any custom function                      |
//!
//! # Identity
//!
//! The cached value is cloned out on every hit. For `Arc` values (including
//! `Arc<dyn Fn ...>` callbacks) the clone is the same allocation, so
//! downstream `Arc::ptr_eq` checks see an unchanged identity for as long as
//! the dependencies stay equal.
//!
//! # Example
//!
//! ```ignore
//! let cache = MemoCache::new();
//!
//! // Keyed by the call site: the same line always hits the same cell.
//! let total = cache.memo((items_rev, tax_rate), || expensive_total(&items, tax_rate));
//!
//! // Stable callback identity.
//! let on_click: Arc<dyn Fn(u32) + Send + Sync> =
//!     cache.memo_keyed("on_click", user_id, || Arc::new(move |n| select(user_id, n)));
//! ```

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::warn;

// =============================================================================
// Equality Policy
// =============================================================================

/// Pluggable equality used by memo cells and selector subscribers.
pub struct Equality<T: ?Sized> {
    compare: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T: ?Sized> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self {
            compare: Arc::clone(&self.compare),
        }
    }
}

impl<T: ?Sized + 'static> Equality<T> {
    /// Custom equality function.
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            compare: Arc::new(compare),
        }
    }

    /// Treat every pair as equal: compute once, never again.
    pub fn always() -> Self {
        Self::new(|_, _| true)
    }

    /// Treat every pair as different: recompute on every call.
    pub fn never() -> Self {
        Self::new(|_, _| false)
    }

    /// Compare two values under this policy.
    pub fn eq(&self, a: &T, b: &T) -> bool {
        (self.compare)(a, b)
    }
}

impl<T: PartialEq + ?Sized + 'static> Equality<T> {
    /// Structural equality via `PartialEq`.
    ///
    /// For tuples and `Vec`s this is the shallow, position-wise comparison
    /// of a dependency list.
    pub fn value() -> Self {
        Self::new(|a: &T, b: &T| a == b)
    }
}

impl<U: ?Sized + 'static> Equality<Arc<U>> {
    /// Reference identity: equal only if both point at the same allocation.
    pub fn pointer() -> Self {
        Self::new(|a: &Arc<U>, b: &Arc<U>| Arc::ptr_eq(a, b))
    }
}

impl<E: 'static> Equality<Vec<E>> {
    /// Position-wise comparison using `slot` for each element.
    ///
    /// Sequences of different length are never equal.
    pub fn elementwise(slot: Equality<E>) -> Self {
        Self::new(move |a: &Vec<E>, b: &Vec<E>| {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| slot.eq(x, y))
        })
    }
}

impl<T: PartialEq + 'static> Default for Equality<T> {
    fn default() -> Self {
        Self::value()
    }
}

impl<T: ?Sized> fmt::Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Equality").finish_non_exhaustive()
    }
}

// =============================================================================
// Memo Cell
// =============================================================================

struct MemoEntry<D, T> {
    deps: D,
    value: T,
}

/// A single memo site: last deps, last value, and an equality policy.
///
/// `compute` runs outside the cell's lock, so it may itself use other memo
/// cells (or even this one) without deadlocking.
pub struct Memo<D, T> {
    slot: Mutex<Option<MemoEntry<D, T>>>,
    equality: Equality<D>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<D: PartialEq + 'static, T> Memo<D, T> {
    /// Create a cell comparing deps with `PartialEq`.
    pub fn new() -> Self {
        Self::with_equality(Equality::value())
    }
}

impl<D: PartialEq + 'static, T> Default for Memo<D, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, T> Memo<D, T> {
    /// Create a cell with a custom dependency equality policy.
    pub fn with_equality(equality: Equality<D>) -> Self {
        Self {
            slot: Mutex::new(None),
            equality,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<MemoEntry<D, T>>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of calls answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of calls that ran `compute`.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop the cached entry; the next call recomputes.
    pub fn invalidate(&self) {
        *self.lock_slot() = None;
    }

    /// Check whether a value is cached.
    pub fn is_cached(&self) -> bool {
        self.lock_slot().is_some()
    }
}

impl<D: 'static, T: Clone> Memo<D, T> {
    /// Return the cached value if `deps` equals the previous deps, otherwise
    /// run `compute` and cache its result with `deps`.
    pub fn get<F>(&self, deps: D, compute: F) -> T
    where
        F: FnOnce() -> T,
    {
        {
            let slot = self.lock_slot();
            if let Some(entry) = slot.as_ref() {
                if self.equality.eq(&entry.deps, &deps) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return entry.value.clone();
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute();
        *self.lock_slot() = Some(MemoEntry {
            deps,
            value: value.clone(),
        });
        value
    }

    /// The cached value without touching deps or counters.
    pub fn peek(&self) -> Option<T> {
        self.lock_slot().as_ref().map(|entry| entry.value.clone())
    }
}

impl<D: 'static, F: ?Sized> Memo<D, Arc<F>> {
    /// Memoize a callback so its identity survives while `deps` are equal.
    pub fn callback<M>(&self, deps: D, make: M) -> Arc<F>
    where
        M: FnOnce() -> Arc<F>,
    {
        self.get(deps, make)
    }
}

impl<D, T> fmt::Debug for Memo<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish_non_exhaustive()
    }
}

/// Memoize through an explicit cell.
pub fn memo<D, T, F>(cell: &Memo<D, T>, deps: D, compute: F) -> T
where
    D: 'static,
    T: Clone,
    F: FnOnce() -> T,
{
    cell.get(deps, compute)
}

// =============================================================================
// Memo Cache
// =============================================================================

/// Identity of a memo site inside a [`MemoCache`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoKey {
    /// A source location captured with `#[track_caller]`.
    Site(&'static Location<'static>),
    /// An explicit name.
    Named(Cow<'static, str>),
}

impl From<&'static str> for MemoKey {
    fn from(name: &'static str) -> Self {
        MemoKey::Named(Cow::Borrowed(name))
    }
}

impl From<String> for MemoKey {
    fn from(name: String) -> Self {
        MemoKey::Named(Cow::Owned(name))
    }
}

impl fmt::Display for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoKey::Site(location) => write!(f, "{}", location),
            MemoKey::Named(name) => f.write_str(name),
        }
    }
}

/// A set of memo cells addressed by [`MemoKey`].
///
/// The equality policy of a site is fixed by its first use. Reusing a key
/// with different dependency or value types replaces the cell.
#[derive(Default)]
pub struct MemoCache {
    cells: DashMap<MemoKey, Arc<dyn Any + Send + Sync>>,
}

impl MemoCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    /// Memoize keyed by the caller's source location, comparing deps with
    /// `PartialEq`.
    #[track_caller]
    pub fn memo<D, T, F>(&self, deps: D, compute: F) -> T
    where
        D: PartialEq + Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce() -> T,
    {
        let key = MemoKey::Site(Location::caller());
        self.memo_keyed_with(key, deps, Equality::value(), compute)
    }

    /// Memoize keyed by the caller's source location with a custom policy.
    #[track_caller]
    pub fn memo_with<D, T, F>(&self, deps: D, equality: Equality<D>, compute: F) -> T
    where
        D: Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce() -> T,
    {
        let key = MemoKey::Site(Location::caller());
        self.memo_keyed_with(key, deps, equality, compute)
    }

    /// Memoize under an explicit key, comparing deps with `PartialEq`.
    pub fn memo_keyed<D, T, F>(&self, key: impl Into<MemoKey>, deps: D, compute: F) -> T
    where
        D: PartialEq + Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce() -> T,
    {
        self.memo_keyed_with(key, deps, Equality::value(), compute)
    }

    /// Memoize under an explicit key with a custom policy.
    pub fn memo_keyed_with<D, T, F>(
        &self,
        key: impl Into<MemoKey>,
        deps: D,
        equality: Equality<D>,
        compute: F,
    ) -> T
    where
        D: Send + 'static,
        T: Clone + Send + 'static,
        F: FnOnce() -> T,
    {
        let cell = self.cell::<D, T>(key.into(), equality);
        cell.get(deps, compute)
    }

    /// Get (or create) the typed cell for `key`.
    pub fn cell<D, T>(&self, key: MemoKey, equality: Equality<D>) -> Arc<Memo<D, T>>
    where
        D: Send + 'static,
        T: Send + 'static,
    {
        let existing = self
            .cells
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Memo::<D, T>::with_equality(equality.clone())) as Arc<dyn Any + Send + Sync>
            })
            .value()
            .clone();

        match existing.downcast::<Memo<D, T>>() {
            Ok(cell) => cell,
            Err(_) => {
                warn!(key = %key, "memo key reused with different types, replacing cell");
                let cell = Arc::new(Memo::<D, T>::with_equality(equality));
                self.cells
                    .insert(key, cell.clone() as Arc<dyn Any + Send + Sync>);
                cell
            }
        }
    }

    /// Forget one memo site.
    pub fn remove(&self, key: &MemoKey) -> bool {
        self.cells.remove(key).is_some()
    }

    /// Discard every memo entry.
    pub fn clear(&self) {
        self.cells.clear();
    }

    /// Number of memo sites.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the cache holds no memo sites.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl fmt::Debug for MemoCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoCache")
            .field("site_count", &self.cells.len())
            .finish()
    }
}
