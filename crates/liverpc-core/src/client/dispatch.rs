//! Path-based client dispatch.
//!
//! [`ClientDispatch`] addresses any procedure or publication by its dotted
//! name without generated stubs. Field access builds a [`DispatchPath`]
//! lazily; only [`DispatchPath::invoke`] touches the transport.
//!
//! ```rust,ignore
//! let client = ClientDispatch::new(transport);
//! let sum = client.field("math")?.field("sum")?;
//! let value = sum.call(vec![json!(1), json!(2)]).await?;
//!
//! // Binding modes are chosen by a terminal marker segment...
//! let query = client.path("math.sum.useQuery")?.invoke(args).await?;
//! // ...or a trailing marker argument.
//! let view = client.path("todos.all")?.invoke(vec![json!("usePublication")]).await?;
//! ```

use super::caller::SafeCaller;
use super::mirror::{LiveView, MirrorStore};
use super::query::{MutationBinding, QueryBinding, QueryCache, QueryKey};
use crate::config::RegistryConfig;
use crate::error::{ErrorKind, RemoteError};
use crate::filter::Filter;
use crate::locks;
use crate::transport::Transport;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Field names that never extend a path.
pub const RESERVED_FIELDS: [&str; 3] = ["then", "toJSON", "prototype"];

/// What an invocation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    Call,
    Query,
    Mutation,
    Publication,
}

impl BindingMode {
    pub const QUERY_MARKER: &'static str = "useQuery";
    pub const MUTATION_MARKER: &'static str = "useMutation";
    pub const PUBLICATION_MARKER: &'static str = "usePublication";

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            Self::QUERY_MARKER => Some(Self::Query),
            Self::MUTATION_MARKER => Some(Self::Mutation),
            Self::PUBLICATION_MARKER => Some(Self::Publication),
            _ => None,
        }
    }

    pub fn marker(&self) -> Option<&'static str> {
        match self {
            Self::Call => None,
            Self::Query => Some(Self::QUERY_MARKER),
            Self::Mutation => Some(Self::MUTATION_MARKER),
            Self::Publication => Some(Self::PUBLICATION_MARKER),
        }
    }
}

/// Result of [`DispatchPath::invoke`].
pub enum Dispatched {
    Value(Value),
    Query(QueryBinding),
    Mutation(MutationBinding),
    Publication(LiveView),
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Query(binding) => f.debug_tuple("Query").field(binding.key()).finish(),
            Self::Mutation(_) => f.write_str("Mutation"),
            Self::Publication(view) => f.debug_tuple("Publication").field(view).finish(),
        }
    }
}

impl Dispatched {
    pub fn mode(&self) -> BindingMode {
        match self {
            Self::Value(_) => BindingMode::Call,
            Self::Query(_) => BindingMode::Query,
            Self::Mutation(_) => BindingMode::Mutation,
            Self::Publication(_) => BindingMode::Publication,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_query(self) -> Option<QueryBinding> {
        match self {
            Self::Query(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn into_mutation(self) -> Option<MutationBinding> {
        match self {
            Self::Mutation(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn into_view(self) -> Option<LiveView> {
        match self {
            Self::Publication(view) => Some(view),
            _ => None,
        }
    }
}

struct DispatchInner {
    transport: Arc<dyn Transport>,
    queries: QueryCache,
    mirrors: MirrorStore,
    mirror_names: Mutex<HashMap<String, String>>,
}

/// Root of the dispatch graph.
#[derive(Clone)]
pub struct ClientDispatch {
    inner: Arc<DispatchInner>,
}

impl fmt::Debug for ClientDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDispatch")
            .field("mirrors", &self.inner.mirrors.names())
            .finish()
    }
}

impl ClientDispatch {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_cache(transport, QueryCache::new())
    }

    pub fn with_cache(transport: Arc<dyn Transport>, queries: QueryCache) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                transport,
                queries,
                mirrors: MirrorStore::new(),
                mirror_names: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a path. `None` for reserved field names.
    pub fn field(&self, name: &str) -> Option<DispatchPath> {
        DispatchPath {
            client: self.clone(),
            segments: Vec::new(),
        }
        .field(name)
    }

    /// Start a path from a dotted name, one field access per segment.
    pub fn path(&self, dotted: &str) -> Option<DispatchPath> {
        let mut segments = dotted.split(RegistryConfig::NAME_SEPARATOR);
        let first = self.field(segments.next()?)?;
        segments.try_fold(first, |path, segment| path.field(segment))
    }

    pub fn queries(&self) -> &QueryCache {
        &self.inner.queries
    }

    pub fn mirrors(&self) -> &MirrorStore {
        &self.inner.mirrors
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Typed calls by name over the same transport.
    pub fn caller(&self) -> SafeCaller {
        SafeCaller::new(self.inner.transport.clone())
    }

    /// Mirror container name of `publication`, asked of the server once and
    /// cached afterwards.
    pub async fn mirror_name(&self, publication: &str) -> Result<String, RemoteError> {
        if let Some(name) = locks::lock(&self.inner.mirror_names).get(publication) {
            return Ok(name.clone());
        }

        let value = self
            .inner
            .transport
            .invoke(
                RegistryConfig::MIRROR_NAME_METHOD,
                vec![Value::String(publication.to_string())],
            )
            .await?;
        let name = match value {
            Value::String(name) => name,
            other => {
                return Err(RemoteError::new(
                    ErrorKind::Validation,
                    format!("Expected a mirror name for {}, got {}", publication, other),
                ))
            }
        };

        debug!("Publication {} mirrors into {}", publication, name);
        locks::lock(&self.inner.mirror_names).insert(publication.to_string(), name.clone());
        Ok(name)
    }
}

/// An accumulated field-access path.
#[derive(Clone)]
pub struct DispatchPath {
    client: ClientDispatch,
    segments: Vec<String>,
}

impl fmt::Debug for DispatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DispatchPath").field(&self.segments).finish()
    }
}

impl DispatchPath {
    /// Extend the path. `None` for reserved field names.
    pub fn field(&self, name: &str) -> Option<DispatchPath> {
        if RESERVED_FIELDS.contains(&name) {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Some(DispatchPath {
            client: self.client.clone(),
            segments,
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The dotted name, markers included.
    pub fn name(&self) -> String {
        self.segments.join(".")
    }

    /// Plain call. Fails if the path or arguments select a binding mode.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, RemoteError> {
        let (mode, name, args) = self.resolve(args)?;
        if mode != BindingMode::Call {
            return Err(RemoteError::new(
                ErrorKind::Validation,
                format!("{} selects a binding, use invoke", self.name()),
            ));
        }
        self.client.inner.transport.invoke(&name, args).await
    }

    /// Dispatch according to the binding mode.
    ///
    /// Query and mutation bindings are built without contacting the server.
    /// A mutation's invocation arguments are prepended to those given to
    /// [`MutationBinding::mutate`]. A publication resolves its mirror name,
    /// subscribes and returns an unfiltered view.
    pub async fn invoke(&self, args: Vec<Value>) -> Result<Dispatched, RemoteError> {
        let (mode, name, args) = self.resolve(args)?;
        let transport = self.client.inner.transport.clone();

        match mode {
            BindingMode::Call => Ok(Dispatched::Value(transport.invoke(&name, args).await?)),
            BindingMode::Query => {
                let key = QueryKey::new(name.clone(), &args);
                let binding = self.client.inner.queries.bind_query(key, move || {
                    let transport = transport.clone();
                    let name = name.clone();
                    let args = args.clone();
                    async move { transport.invoke(&name, args).await }
                });
                Ok(Dispatched::Query(binding))
            }
            BindingMode::Mutation => {
                let binding = self.client.inner.queries.bind_mutation(move |extra| {
                    let transport = transport.clone();
                    let name = name.clone();
                    let mut all = args.clone();
                    all.extend(extra);
                    async move { transport.invoke(&name, all).await }
                });
                Ok(Dispatched::Mutation(binding))
            }
            BindingMode::Publication => Ok(Dispatched::Publication(
                self.open(name, args, Filter::all()).await?,
            )),
        }
    }

    /// Subscribe to the publication at this path and view the rows matching
    /// `filter`. A publication marker, if present, is stripped.
    pub async fn watch(&self, args: Vec<Value>, filter: Filter) -> Result<LiveView, RemoteError> {
        let (_, name, args) = self.resolve(args)?;
        self.open(name, args, filter).await
    }

    async fn open(&self, name: String, args: Vec<Value>, filter: Filter) -> Result<LiveView, RemoteError> {
        let mirror = self.client.mirror_name(&name).await?;
        let subscription = self.client.inner.transport.subscribe(&name, args).await?;
        let container = self.client.inner.mirrors.get_or_create(&mirror);
        Ok(LiveView::subscribed(container, filter, subscription))
    }

    /// Strip a binding marker from the terminal segment or the trailing
    /// argument and return the mode, procedure name and remaining args.
    fn resolve(&self, mut args: Vec<Value>) -> Result<(BindingMode, String, Vec<Value>), RemoteError> {
        let mut segments = self.segments.as_slice();
        let mut mode = BindingMode::Call;

        if let Some((last, rest)) = segments.split_last() {
            if let Some(marked) = BindingMode::from_marker(last) {
                mode = marked;
                segments = rest;
            }
        }
        if mode == BindingMode::Call {
            let trailing = match args.last() {
                Some(Value::String(marker)) => BindingMode::from_marker(marker),
                _ => None,
            };
            if let Some(marked) = trailing {
                mode = marked;
                args.pop();
            }
        }

        if segments.is_empty() {
            return Err(RemoteError::new(
                ErrorKind::Validation,
                "Cannot invoke an empty path",
            ));
        }
        Ok((mode, segments.join("."), args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::Procedure;
    use crate::publication::memory::MemoryCollection;
    use crate::publication::{
        Fields, LiveSource, Publication, PublicationConfig, Subscription,
    };
    use crate::registry::Registry;
    use crate::resolver::Resolver;
    use crate::schema::{json, NoArgs};
    use crate::transport::{LocalTransport, RemoteSubscription};
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<(String, Vec<Value>)> {
            locks::lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
            locks::lock(&self.calls).push((name.to_string(), args.clone()));
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        }

        async fn subscribe(&self, name: &str, _args: Vec<Value>) -> Result<RemoteSubscription, RemoteError> {
            Err(RemoteError::new(ErrorKind::NotFound, name))
        }
    }

    fn recording_client() -> (Arc<RecordingTransport>, ClientDispatch) {
        let transport = Arc::new(RecordingTransport::default());
        let client = ClientDispatch::new(transport.clone());
        (transport, client)
    }

    #[tokio::test]
    async fn test_path_invocation_makes_one_call() {
        let (transport, client) = recording_client();
        let sum = client.field("math").unwrap().field("sum").unwrap();
        assert!(transport.calls().is_empty());

        let result = sum.call(vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(result, json!(3));
        assert_eq!(
            transport.calls(),
            vec![("math.sum".to_string(), vec![json!(1), json!(2)])]
        );
    }

    #[test]
    fn test_reserved_fields_do_not_extend_path() {
        let (_, client) = recording_client();
        assert!(client.field("then").is_none());
        let math = client.field("math").unwrap();
        assert!(math.field("toJSON").is_none());
        assert!(math.field("prototype").is_none());
        assert_eq!(math.segments(), ["math".to_string()]);
        assert!(client.path("math.then.sum").is_none());
    }

    #[tokio::test]
    async fn test_query_marker_builds_cached_binding() {
        let (transport, client) = recording_client();
        let query = client
            .path("math.sum.useQuery")
            .unwrap()
            .invoke(vec![json!(2), json!(3)])
            .await
            .unwrap()
            .into_query()
            .unwrap();
        assert!(transport.calls().is_empty());
        assert_eq!(query.key().name(), "math.sum");

        assert_eq!(query.load().await.unwrap(), json!(5));
        let again = client
            .path("math.sum")
            .unwrap()
            .invoke(vec![json!(2), json!(3), json!("useQuery")])
            .await
            .unwrap()
            .into_query()
            .unwrap();
        assert_eq!(again.load().await.unwrap(), json!(5));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mutation_marker_defers_call() {
        let (transport, client) = recording_client();
        let mutation = client
            .path("math.sum")
            .unwrap()
            .invoke(vec![json!(10), json!("useMutation")])
            .await
            .unwrap()
            .into_mutation()
            .unwrap();
        assert!(transport.calls().is_empty());

        assert_eq!(mutation.mutate(vec![json!(5)]).await.unwrap(), json!(15));
        assert_eq!(
            transport.calls(),
            vec![("math.sum".to_string(), vec![json!(10), json!(5)])]
        );
    }

    #[tokio::test]
    async fn test_call_rejects_binding_paths() {
        let (_, client) = recording_client();
        let err = client.path("math.sum.useQuery").unwrap().call(vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let err = client.path("useQuery").unwrap().invoke(vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_publication_marker_fills_mirror() {
        let registry = Arc::new(Registry::new());
        let todos = MemoryCollection::new("todos");
        let mut fields = Fields::new();
        fields.insert("title".into(), json!("A"));
        todos.insert("a", fields).unwrap();

        let source = todos.clone();
        let publication = Publication::define(
            "todos.all",
            NoArgs,
            Some(Resolver::from_fn(move |()| {
                Ok(Arc::new(source.find(Filter::all())) as Arc<dyn LiveSource>)
            })),
            Some(PublicationConfig {
                mirror_name: Some("todos".into()),
                ..PublicationConfig::default()
            }),
        );
        registry.register_publication(publication).unwrap();
        let echo = Procedure::define(
            "echo",
            json::<Value>(),
            Some(Resolver::from_fn(|v: Value| Ok(v))),
            None,
        );
        registry.register_procedure(echo).unwrap();

        let client = ClientDispatch::new(Arc::new(LocalTransport::new(registry)));
        let mut view = client
            .path("todos.all.usePublication")
            .unwrap()
            .invoke(vec![])
            .await
            .unwrap()
            .into_view()
            .unwrap();
        view.ready().await.unwrap();
        assert_eq!(view.snapshot(), vec![json!({"_id": "a", "title": "A"})]);
        assert_eq!(view.container().name(), "todos");
        assert!(client.mirrors().get("todos").is_some());

        drop(view);
        assert!(client.mirrors().get("todos").unwrap().is_empty());

        let echoed = client.path("echo").unwrap().call(vec![json!("hi")]).await.unwrap();
        assert_eq!(echoed, json!("hi"));
    }

    #[tokio::test]
    async fn test_mirror_name_is_cached() {
        struct MirrorOnly {
            asked: Mutex<usize>,
        }

        #[async_trait]
        impl Transport for MirrorOnly {
            async fn invoke(&self, _name: &str, _args: Vec<Value>) -> Result<Value, RemoteError> {
                *locks::lock(&self.asked) += 1;
                Ok(json!("shared"))
            }

            async fn subscribe(&self, name: &str, _args: Vec<Value>) -> Result<Subscription, RemoteError> {
                Err(RemoteError::new(ErrorKind::NotFound, name))
            }
        }

        let transport = Arc::new(MirrorOnly {
            asked: Mutex::new(0),
        });
        let client = ClientDispatch::new(transport.clone());
        assert_eq!(client.mirror_name("a").await.unwrap(), "shared");
        assert_eq!(client.mirror_name("a").await.unwrap(), "shared");
        assert_eq!(*locks::lock(&transport.asked), 1);
    }
}
