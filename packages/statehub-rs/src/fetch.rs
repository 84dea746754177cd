//! Loading/data/error lifecycle for asynchronously fetched values.
//!
//! A fetch moves through three actions:
//!
//! ```text
//! Started ──► loading = true
//!    │
//!    ├── Succeeded(data) ──► loading = false, data = Some, error = None
//!    └── Failed(message) ──► loading = false, data = None, error = Some
//! ```
//!
//! The request itself runs outside the store; see `Store::spawn_dispatch`.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::Action;
use crate::reducer::Reducer;

/// State slice for one fetched value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchState<T> {
    pub loading: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> FetchState<T> {
    /// Nothing requested yet.
    pub fn idle() -> Self {
        Self {
            loading: false,
            data: None,
            error: None,
        }
    }

    /// A request is expected to be in flight from the start.
    pub fn loading() -> Self {
        Self {
            loading: true,
            ..Self::idle()
        }
    }

    /// Returns true once data has arrived and no request is pending.
    pub fn is_ready(&self) -> bool {
        !self.loading && self.data.is_some()
    }

    /// Returns true if the last request failed.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

/// Lifecycle actions for a [`FetchState`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchAction<T> {
    Started,
    Succeeded(T),
    Failed(String),
}

impl<T> FetchAction<T> {
    /// Map a request result onto the matching lifecycle action.
    pub fn from_result<E: fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => FetchAction::Succeeded(data),
            Err(e) => FetchAction::Failed(e.to_string()),
        }
    }
}

impl<T: Send + 'static> Action for FetchAction<T> {
    fn kind(&self) -> Cow<'_, str> {
        match self {
            FetchAction::Started => "fetch_started".into(),
            FetchAction::Succeeded(_) => "fetch_succeeded".into(),
            FetchAction::Failed(_) => "fetch_failed".into(),
        }
    }
}

fn identity<T>(action: &FetchAction<T>) -> Option<&FetchAction<T>> {
    Some(action)
}

/// Reducer driving a [`FetchState`] slice.
///
/// `select` picks the fetch action out of the store's action type, so one
/// store can hold several fetch slices.
///
/// # Example
///
/// ```ignore
/// enum PageAction {
///     Post(FetchAction<Post>),
///     Comments(FetchAction<Vec<Comment>>),
/// }
///
/// let store = Store::builder()
///     .with_slice("post", FetchState::loading(), FetchReducer::new(|a: &PageAction| match a {
///         PageAction::Post(fetch) => Some(fetch),
///         _ => None,
///     }))
///     .build()?;
/// ```
pub struct FetchReducer<T, F> {
    select: F,
    _data: PhantomData<fn() -> T>,
}

impl<T, F> FetchReducer<T, F> {
    /// Create a reducer that reacts to the fetch actions `select` extracts.
    pub fn new<A>(select: F) -> Self
    where
        F: Fn(&A) -> Option<&FetchAction<T>>,
    {
        Self {
            select,
            _data: PhantomData,
        }
    }
}

impl<T> FetchReducer<T, fn(&FetchAction<T>) -> Option<&FetchAction<T>>> {
    /// Reducer for a store whose action type is `FetchAction<T>` itself.
    pub fn direct() -> Self {
        Self {
            select: identity::<T>,
            _data: PhantomData,
        }
    }
}

impl<A, T, F> Reducer<A, FetchState<T>> for FetchReducer<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&A) -> Option<&FetchAction<T>> + Send + Sync + 'static,
{
    fn reduce(
        &self,
        state: &Arc<FetchState<T>>,
        action: &A,
    ) -> anyhow::Result<Arc<FetchState<T>>> {
        let Some(action) = (self.select)(action) else {
            return Ok(Arc::clone(state));
        };

        let next = match action {
            // Already loading: nothing to change
            FetchAction::Started if state.loading && state.error.is_none() => {
                return Ok(Arc::clone(state));
            }
            FetchAction::Started => FetchState {
                loading: true,
                data: state.data.clone(),
                error: None,
            },
            FetchAction::Succeeded(data) => FetchState {
                loading: false,
                data: Some(data.clone()),
                error: None,
            },
            FetchAction::Failed(message) => FetchState {
                loading: false,
                data: None,
                error: Some(message.clone()),
            },
        };
        Ok(Arc::new(next))
    }
}

impl<T, F> fmt::Debug for FetchReducer<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchReducer")
            .field("data_type", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::State;
    use crate::store::Store;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: u32,
        title: String,
    }

    fn post() -> Post {
        Post {
            id: 1,
            title: "sunt aut facere".to_string(),
        }
    }

    fn post_state(state: &State) -> FetchState<Post> {
        state
            .get::<FetchState<Post>>("post")
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn test_success_lifecycle() {
        let reducer = FetchReducer::<Post, _>::direct();
        let state = Arc::new(FetchState::<Post>::idle());

        let loading = reducer.reduce(&state, &FetchAction::Started).unwrap();
        assert!(loading.loading);

        let done = reducer
            .reduce(&loading, &FetchAction::Succeeded(post()))
            .unwrap();
        assert!(done.is_ready());
        assert_eq!(done.data, Some(post()));
        assert_eq!(done.error, None);
    }

    #[test]
    fn test_failure_clears_data() {
        let reducer = FetchReducer::<Post, _>::direct();
        let state = Arc::new(FetchState {
            loading: false,
            data: Some(post()),
            error: None,
        });

        let failed = reducer
            .reduce(&state, &FetchAction::Failed("Something went wrong!".into()))
            .unwrap();

        assert!(!failed.loading);
        assert!(failed.data.is_none());
        assert!(failed.is_failed());
    }

    #[test]
    fn test_started_while_loading_is_noop() {
        let reducer = FetchReducer::<Post, _>::direct();
        let state = Arc::new(FetchState::<Post>::loading());

        let next = reducer.reduce(&state, &FetchAction::Started).unwrap();
        assert!(Arc::ptr_eq(&state, &next));
    }

    #[test]
    fn test_refetch_keeps_stale_data() {
        let reducer = FetchReducer::<Post, _>::direct();
        let state = Arc::new(FetchState {
            loading: false,
            data: Some(post()),
            error: None,
        });

        let next = reducer.reduce(&state, &FetchAction::Started).unwrap();
        assert!(next.loading);
        assert_eq!(next.data, Some(post()));
    }

    #[test]
    fn test_selected_from_app_action() {
        #[derive(Debug)]
        enum PageAction {
            Post(FetchAction<Post>),
            Comments(FetchAction<Vec<String>>),
        }
        impl Action for PageAction {}

        let store = Store::<PageAction>::builder()
            .with_slice(
                "post",
                FetchState::<Post>::loading(),
                FetchReducer::new(|a: &PageAction| match a {
                    PageAction::Post(fetch) => Some(fetch),
                    _ => None,
                }),
            )
            .with_slice(
                "comments",
                FetchState::<Vec<String>>::idle(),
                FetchReducer::new(|a: &PageAction| match a {
                    PageAction::Comments(fetch) => Some(fetch),
                    _ => None,
                }),
            )
            .build()
            .unwrap();

        store
            .dispatch(PageAction::Comments(FetchAction::Succeeded(vec!["first".into()])))
            .unwrap();

        // The post slice ignored the comments action
        let state = store.get_state();
        assert!(post_state(&state).loading);
        assert!(state
            .get::<FetchState<Vec<String>>>("comments")
            .is_some_and(FetchState::is_ready));

        store
            .dispatch(PageAction::Post(FetchAction::Failed("offline".into())))
            .unwrap();
        let state = store.get_state();
        assert_eq!(post_state(&state).error.as_deref(), Some("offline"));
        assert!(State::slice_unchanged(&store.get_state(), &state, "comments"));
    }

    #[test]
    fn test_from_result() {
        let ok: FetchAction<u32> = FetchAction::from_result(Ok::<u32, String>(3));
        assert_eq!(ok, FetchAction::Succeeded(3));

        let err: FetchAction<u32> = FetchAction::from_result(Err::<u32, _>("timeout"));
        assert_eq!(err, FetchAction::Failed("timeout".to_string()));
    }

    #[test]
    fn test_state_serializes() {
        let state = FetchState {
            loading: false,
            data: Some(post()),
            error: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["data"]["title"], "sunt aut facere");
        assert_eq!(json["loading"], false);
    }

    #[tokio::test]
    async fn test_spawned_fetch_fills_slice() {
        let store = Store::<FetchAction<Post>>::builder()
            .with_slice("post", FetchState::<Post>::idle(), FetchReducer::direct())
            .build()
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe_selector(
            |state: &State| post_state(state).loading,
            move |loading: &bool| {
                sink.lock().unwrap().push(*loading);
                Ok(())
            },
        );

        store.dispatch(FetchAction::Started).unwrap();
        store
            .spawn_dispatch(async { FetchAction::from_result(Ok::<_, String>(post())) })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(post_state(&store.get_state()).data, Some(post()));
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }
}
