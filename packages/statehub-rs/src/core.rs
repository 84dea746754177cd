//! Core types for the statehub store.
//!
//! # Overview
//!
//! statehub separates **instructions** from **snapshots**:
//! - [`Action`] = Instruction (what the caller wants to happen)
//! - [`State`] = Snapshot (what the store currently holds)
//!
//! The key principle: **State is never mutated in place**. A transition either
//! hands back the very same snapshot (a no-op, detectable with
//! [`State::ptr_eq`]) or builds a new, fully-formed snapshot.
//!
//! # Slices
//!
//! A snapshot is a mapping from [`SliceKey`]s to typed values. Each slice is
//! owned by exactly one reducer, so independent parts of the state evolve
//! independently and unchanged slices are shared between snapshots.

use std::any::Any;
use std::borrow::{Borrow, Cow};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Type-erased slice value shared between snapshots.
pub(crate) type SliceValue = Arc<dyn Any + Send + Sync>;

/// An instruction describing an intended state transition.
///
/// Actions are usually application enums. They are immutable once
/// dispatched and consumed exactly once by the reducer engine.
///
/// Every action must carry everything its reducers need. Reducers read only
/// the state they are handed and the action itself, never captured outer
/// variables, so a late action is still reduced correctly against whatever
/// the current state is.
///
/// # Example
///
/// ```ignore
/// use std::borrow::Cow;
/// use statehub::Action;
///
/// enum CounterAction {
///     Increment,
///     Add(i64),
///     Reset,
/// }
///
/// impl Action for CounterAction {
///     fn kind(&self) -> Cow<'_, str> {
///         match self {
///             CounterAction::Increment => "increment".into(),
///             CounterAction::Add(_) => "add".into(),
///             CounterAction::Reset => "reset".into(),
///         }
///     }
/// }
/// ```
pub trait Action: Send + 'static {
    /// Human-readable name used in logs, errors and the transition log.
    ///
    /// Defaults to the Rust type name.
    fn kind(&self) -> Cow<'_, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

/// Untyped `{ kind, payload? }` action.
///
/// Useful when actions arrive from outside the process (a websocket, a
/// message queue) and the reducers match on the kind string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedAction {
    /// The action kind, e.g. `"increment"`.
    pub kind: String,
    /// Optional JSON payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl TaggedAction {
    /// Create an action without a payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
        }
    }

    /// Create an action carrying a serialized payload.
    pub fn with_payload<P: Serialize>(
        kind: impl Into<String>,
        payload: &P,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.into(),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Check the action kind.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Deserialize the payload, if present.
    pub fn payload_as<P: DeserializeOwned>(&self) -> serde_json::Result<Option<P>> {
        self.payload
            .as_ref()
            .map(|value| P::deserialize(value))
            .transpose()
    }
}

impl Action for TaggedAction {
    fn kind(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.kind)
    }
}

/// Name of a state slice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceKey(Cow<'static, str>);

impl SliceKey {
    /// Create a key from a static name.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for SliceKey {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for SliceKey {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl Borrow<str> for SliceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic snapshot revision.
///
/// # Semantics
///
/// - [`Revision::INITIAL`] is the snapshot built when the store is created.
/// - Each applied transition advances the revision by one.
/// - A no-op dispatch does not advance the revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    /// Revision of the snapshot built at store construction.
    pub const INITIAL: Revision = Revision(0);

    /// Get the next revision.
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    /// Check if this is the initial revision.
    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// Get the inner value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

struct Snapshot {
    revision: Revision,
    slices: BTreeMap<SliceKey, SliceValue>,
}

/// Immutable state snapshot.
///
/// Cloning a `State` clones a reference, not the data. Two clones of the same
/// snapshot are [`State::ptr_eq`]; the store relies on this to detect no-op
/// transitions without comparing values.
///
/// # Example
///
/// ```ignore
/// let state = store.get_state();
/// let count: Option<&i64> = state.get("count");
/// let user: Option<Arc<User>> = state.get_arc("user");
/// ```
#[derive(Clone)]
pub struct State {
    inner: Arc<Snapshot>,
}

impl State {
    pub(crate) fn from_slices(
        revision: Revision,
        slices: BTreeMap<SliceKey, SliceValue>,
    ) -> Self {
        Self {
            inner: Arc::new(Snapshot { revision, slices }),
        }
    }

    /// Build the successor snapshot, sharing every slice not in `changes`.
    pub(crate) fn with_changes(&self, changes: Vec<(SliceKey, SliceValue)>) -> Self {
        let mut slices = self.inner.slices.clone();
        for (key, value) in changes {
            slices.insert(key, value);
        }
        Self::from_slices(self.inner.revision.next(), slices)
    }

    /// Build a snapshot holding `slices` at the revision after this one.
    pub(crate) fn succeeded_by(&self, slices: BTreeMap<SliceKey, SliceValue>) -> Self {
        Self::from_slices(self.inner.revision.next(), slices)
    }

    pub(crate) fn slice(&self, key: &str) -> Option<&SliceValue> {
        self.inner.slices.get(key)
    }

    pub(crate) fn slices(&self) -> &BTreeMap<SliceKey, SliceValue> {
        &self.inner.slices
    }

    /// The revision of this snapshot.
    pub fn revision(&self) -> Revision {
        self.inner.revision
    }

    /// Borrow a slice value.
    ///
    /// Returns `None` if the slice doesn't exist or holds a different type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        let value = self.inner.slices.get(key)?;
        (**value).downcast_ref::<T>()
    }

    /// Get a shared handle to a slice value.
    ///
    /// The returned `Arc` is the one stored in the snapshot, so comparing two
    /// of them with [`Arc::ptr_eq`] tells whether the slice changed.
    pub fn get_arc<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.slices.get(key)?.clone();
        value.downcast::<T>().ok()
    }

    /// Check whether a slice exists.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.slices.contains_key(key)
    }

    /// Slice keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &SliceKey> {
        self.inner.slices.keys()
    }

    /// Number of slices.
    pub fn len(&self) -> usize {
        self.inner.slices.len()
    }

    /// Check if the snapshot has no slices.
    pub fn is_empty(&self) -> bool {
        self.inner.slices.is_empty()
    }

    /// Reference identity: true if both handles point at the same snapshot.
    pub fn ptr_eq(a: &State, b: &State) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// True if the named slice is the same shared value in both snapshots.
    pub fn slice_unchanged(a: &State, b: &State, key: &str) -> bool {
        match (a.slice(key), b.slice(key)) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("revision", &self.inner.revision)
            .field("slices", &self.inner.slices.keys().collect::<Vec<_>>())
            .finish()
    }
}
