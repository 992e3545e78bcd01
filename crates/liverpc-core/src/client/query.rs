//! Client-side query cache and mutation bindings.
//!
//! Query bindings are shared per `(name, args)` key through a TTL cache, so
//! every binding for the same key sees the same state and one fetch serves
//! them all until the entry expires or is invalidated.

use crate::config::QueryConfig;
use crate::error::RemoteError;
use futures::future::BoxFuture;
use futures::FutureExt;
use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::debug;

type QueryFetch = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;
type MutationFetch =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

/// Lifecycle of a query or mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot of a binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<RemoteError>,
}

/// Cache key: procedure name plus canonical JSON of the arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    name: String,
    args: String,
}

impl QueryKey {
    pub fn new(name: impl Into<String>, args: &[Value]) -> Self {
        // Object keys serialize in sorted order, so equal arguments give
        // equal keys.
        let args = serde_json::to_string(args).unwrap_or_default();
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.args)
    }
}

struct QueryEntry {
    state: watch::Sender<QueryState>,
    fetching: Mutex<()>,
}

/// Shared cache of query states.
#[derive(Clone)]
pub struct QueryCache {
    entries: Cache<QueryKey, Arc<QueryEntry>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_ttl(QueryConfig::DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(QueryConfig::MAX_CAPACITY)
                .build(),
        }
    }

    /// Bind a query. Nothing is fetched until the binding is loaded.
    pub fn bind_query<F, Fut>(&self, key: QueryKey, fetch: F) -> QueryBinding
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let entry = match self.entries.get(&key) {
            Some(entry) => entry,
            None => {
                let (state, _) = watch::channel(QueryState::default());
                let entry = Arc::new(QueryEntry {
                    state,
                    fetching: Mutex::new(()),
                });
                self.entries.insert(key.clone(), entry.clone());
                entry
            }
        };
        QueryBinding {
            key,
            entry,
            fetch: Arc::new(move || fetch().boxed()),
        }
    }

    /// Bind a mutation. `fetch` runs on every [`MutationBinding::mutate`].
    pub fn bind_mutation<F, Fut>(&self, fetch: F) -> MutationBinding
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let (state, _) = watch::channel(QueryState::default());
        MutationBinding {
            state: Arc::new(state),
            fetch: Arc::new(move |args| fetch(args).boxed()),
        }
    }

    /// Drop the cached state of `key`; the next binding fetches again.
    pub fn invalidate(&self, key: &QueryKey) {
        debug!("Invalidating query {}", key);
        self.entries.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }
}

/// A cached query bound to one `(name, args)` key.
#[derive(Clone)]
pub struct QueryBinding {
    key: QueryKey,
    entry: Arc<QueryEntry>,
    fetch: QueryFetch,
}

impl QueryBinding {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn state(&self) -> QueryState {
        self.entry.state.borrow().clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.entry.state.borrow().status
    }

    pub fn data(&self) -> Option<Value> {
        self.entry.state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<RemoteError> {
        self.entry.state.borrow().error.clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<QueryState> {
        self.entry.state.subscribe()
    }

    /// The cached data, fetching it first if there is none.
    pub async fn load(&self) -> Result<Value, RemoteError> {
        let _fetching = self.entry.fetching.lock().await;
        if let Some(data) = self.cached() {
            return Ok(data);
        }
        self.run_fetch().await
    }

    /// Fetch again regardless of the cached state.
    pub async fn refetch(&self) -> Result<Value, RemoteError> {
        let _fetching = self.entry.fetching.lock().await;
        self.run_fetch().await
    }

    fn cached(&self) -> Option<Value> {
        let state = self.entry.state.borrow();
        match state.status {
            QueryStatus::Success => state.data.clone(),
            _ => None,
        }
    }

    async fn run_fetch(&self) -> Result<Value, RemoteError> {
        self.entry.state.send_modify(|state| state.status = QueryStatus::Loading);
        let result = (self.fetch)().await;
        self.entry.state.send_modify(|state| match &result {
            Ok(data) => {
                state.status = QueryStatus::Success;
                state.data = Some(data.clone());
                state.error = None;
            }
            Err(e) => {
                state.status = QueryStatus::Error;
                state.error = Some(e.clone());
            }
        });
        result
    }
}

/// A mutation whose action performs the call.
#[derive(Clone)]
pub struct MutationBinding {
    state: Arc<watch::Sender<QueryState>>,
    fetch: MutationFetch,
}

impl MutationBinding {
    pub async fn mutate(&self, args: Vec<Value>) -> Result<Value, RemoteError> {
        self.state.send_modify(|state| state.status = QueryStatus::Loading);
        let result = (self.fetch)(args).await;
        self.state.send_modify(|state| match &result {
            Ok(data) => {
                *state = QueryState {
                    status: QueryStatus::Success,
                    data: Some(data.clone()),
                    error: None,
                }
            }
            Err(e) => {
                *state = QueryState {
                    status: QueryStatus::Error,
                    data: None,
                    error: Some(e.clone()),
                }
            }
        });
        result
    }

    pub fn status(&self) -> QueryStatus {
        self.state.borrow().status
    }

    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    /// Back to `Idle`, forgetting the last result.
    pub fn reset(&self) {
        self.state.send_replace(QueryState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fetch(calls: Arc<AtomicUsize>) -> impl Fn() -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync {
        move || {
            let calls = calls.clone();
            async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst) + 1)) }.boxed()
        }
    }

    #[test]
    fn test_key_is_canonical() {
        let a = QueryKey::new("todos.find", &[json!({"a": 1, "b": 2})]);
        let b = QueryKey::new("todos.find", &[json!({"b": 2, "a": 1})]);
        assert_eq!(a, b);
        assert_ne!(a, QueryKey::new("todos.find", &[json!({"a": 2})]));
    }

    #[tokio::test]
    async fn test_query_fetches_once_per_key() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("math.sum", &[json!(1), json!(2)]);

        let first = cache.bind_query(key.clone(), counting_fetch(calls.clone()));
        assert_eq!(first.status(), QueryStatus::Idle);
        assert_eq!(first.load().await.unwrap(), json!(1));

        let second = cache.bind_query(key.clone(), counting_fetch(calls.clone()));
        assert_eq!(second.status(), QueryStatus::Success);
        assert_eq!(second.load().await.unwrap(), json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(second.refetch().await.unwrap(), json!(2));
        assert_eq!(first.data(), Some(json!(2)));

        cache.invalidate(&key);
        let third = cache.bind_query(key, counting_fetch(calls.clone()));
        assert_eq!(third.status(), QueryStatus::Idle);
    }

    #[tokio::test]
    async fn test_query_error_state() {
        let cache = QueryCache::new();
        let binding = cache.bind_query(QueryKey::new("broken", &[]), || async {
            Err(RemoteError::new(ErrorKind::Resolver, "boom"))
        });
        assert!(binding.load().await.is_err());
        assert_eq!(binding.status(), QueryStatus::Error);
        assert_eq!(binding.error().unwrap().message, "boom");
    }

    #[tokio::test]
    async fn test_mutation_lifecycle() {
        let cache = QueryCache::new();
        let mutation = cache.bind_mutation(|args: Vec<Value>| async move { Ok(Value::Array(args)) });
        assert_eq!(mutation.status(), QueryStatus::Idle);

        let result = mutation.mutate(vec![json!("title")]).await.unwrap();
        assert_eq!(result, json!(["title"]));
        assert_eq!(mutation.status(), QueryStatus::Success);

        mutation.reset();
        assert_eq!(mutation.state(), QueryState::default());
    }
}
