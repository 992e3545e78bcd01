//! Module composition and deferred resolver binding.
//!
//! A [`Module`] groups procedures and publications under a dotted prefix:
//! `Module::new("math").add_method("sum", ..)` defines `math.sum`. Modules
//! nest through [`Module::add_submodule`], so `math.trig.sin` is the `sin`
//! leaf of the `trig` submodule of `math`.
//!
//! Middlewares queued with [`Module::add_middlewares`] are appended as
//! before-hooks to every leaf, nested ones included, when the module is
//! built. [`Module::safe_build`] additionally returns a [`ResolverBinder`] for
//! wiring resolvers to contracts that were declared without one.
//!
//! Names are concatenated without escaping. A leaf whose own name contains
//! the separator can collide with a nested path; lookups prefer the exact
//! key.

use crate::config::RegistryConfig;
use crate::error::{Result, RpcError};
use crate::hooks::Middleware;
use crate::procedure::{DynProcedure, Procedure, ProcedureConfig};
use crate::publication::{Cursors, DynPublication, LiveSource, Publication, PublicationConfig};
use crate::resolver::Resolver;
use crate::schema::Validator;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One named member of a module.
#[derive(Clone)]
pub enum Entry {
    Procedure(Arc<dyn DynProcedure>),
    Publication(Arc<dyn DynPublication>),
    Module(ModuleEntries),
}

impl Entry {
    /// Fully qualified name of a leaf. `None` for a nested module.
    pub fn name(&self) -> Option<&str> {
        match self {
            Entry::Procedure(p) => Some(p.name()),
            Entry::Publication(p) => Some(p.name()),
            Entry::Module(_) => None,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Procedure(p) => write!(f, "Procedure({})", p.name()),
            Entry::Publication(p) => write!(f, "Publication({})", p.name()),
            Entry::Module(m) => f.debug_tuple("Module").field(m).finish(),
        }
    }
}

/// The finalized members of a built module, keyed by local name.
#[derive(Clone, Default)]
pub struct ModuleEntries {
    entries: BTreeMap<String, Entry>,
}

impl fmt::Debug for ModuleEntries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl ModuleEntries {
    /// Look up a member by local key. Dotted keys descend into nested
    /// modules (`"trig.sin"`).
    pub fn get(&self, key: &str) -> Option<&Entry> {
        if let Some(entry) = self.entries.get(key) {
            return Some(entry);
        }
        let (head, rest) = key.split_once(RegistryConfig::NAME_SEPARATOR)?;
        match self.entries.get(head)? {
            Entry::Module(nested) => nested.get(rest),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Typed handle of a procedure member.
    pub fn procedure<I, O>(&self, key: &str) -> Option<Procedure<I, O>>
    where
        I: Clone + Send + Sync + 'static,
        O: Serialize + Send + Sync + 'static,
    {
        match self.get(key)? {
            Entry::Procedure(p) => p.as_any().downcast_ref::<Procedure<I, O>>().cloned(),
            _ => None,
        }
    }

    /// Typed handle of a publication member.
    pub fn publication<I>(&self, key: &str) -> Option<Publication<I>>
    where
        I: Clone + Send + Sync + 'static,
    {
        match self.get(key)? {
            Entry::Publication(p) => p.as_any().downcast_ref::<Publication<I>>().cloned(),
            _ => None,
        }
    }

    /// Every procedure, nested ones included.
    pub fn procedures(&self) -> Vec<Arc<dyn DynProcedure>> {
        let mut out = Vec::new();
        self.walk(&mut |entry| {
            if let Entry::Procedure(p) = entry {
                out.push(p.clone());
            }
        });
        out
    }

    /// Every publication, nested ones included.
    pub fn publications(&self) -> Vec<Arc<dyn DynPublication>> {
        let mut out = Vec::new();
        self.walk(&mut |entry| {
            if let Entry::Publication(p) = entry {
                out.push(p.clone());
            }
        });
        out
    }

    /// Fully qualified names of every leaf.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(&mut |entry| {
            if let Some(name) = entry.name() {
                out.push(name.to_string());
            }
        });
        out
    }

    fn walk(&self, visit: &mut dyn FnMut(&Entry)) {
        for entry in self.entries.values() {
            match entry {
                Entry::Module(nested) => nested.walk(visit),
                leaf => visit(leaf),
            }
        }
    }

    fn apply_middlewares(&self, middlewares: &[Middleware]) {
        if middlewares.is_empty() {
            return;
        }
        self.walk(&mut |entry| {
            for middleware in middlewares {
                match entry {
                    Entry::Procedure(p) => p.add_middleware(middleware.clone()),
                    Entry::Publication(p) => p.add_middleware(middleware.clone()),
                    Entry::Module(_) => {}
                }
            }
        });
    }

    fn insert(&mut self, key: String, entry: Entry) {
        if self.entries.insert(key.clone(), entry).is_some() {
            debug!("Module entry {} replaced", key);
        }
    }
}

/// A module under construction.
///
/// Every `add_*` consumes the module and returns the extended one; clone a
/// module to keep a copy of an earlier stage.
#[derive(Clone, Default)]
pub struct Module {
    prefix: Option<String>,
    entries: ModuleEntries,
    middlewares: Vec<Middleware>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("prefix", &self.prefix)
            .field("entries", &self.entries)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl Module {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    /// A module without prefix; leaves keep their bare names.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// An empty module for a submodule named `name` of this one.
    pub fn child(&self, name: &str) -> Module {
        Module::new(self.qualify(name))
    }

    fn qualify(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}{}", prefix, RegistryConfig::NAME_SEPARATOR, name),
            None => name.to_string(),
        }
    }

    /// Define a procedure named `{prefix}.{name}`.
    pub fn add_method<I, O, V>(
        self,
        name: &str,
        schema: V,
        resolver: Option<Resolver<I, O>>,
        config: Option<ProcedureConfig<I, O>>,
    ) -> Self
    where
        I: Clone + Send + Sync + 'static,
        O: Serialize + Send + Sync + 'static,
        V: Validator<Output = I>,
    {
        let procedure = Procedure::define(self.qualify(name), schema, resolver, config);
        self.add_procedure(name, procedure)
    }

    /// Alias of [`Module::add_method`] for read operations.
    pub fn add_query<I, O, V>(
        self,
        name: &str,
        schema: V,
        resolver: Option<Resolver<I, O>>,
        config: Option<ProcedureConfig<I, O>>,
    ) -> Self
    where
        I: Clone + Send + Sync + 'static,
        O: Serialize + Send + Sync + 'static,
        V: Validator<Output = I>,
    {
        self.add_method(name, schema, resolver, config)
    }

    /// Alias of [`Module::add_method`] for write operations.
    pub fn add_mutation<I, O, V>(
        self,
        name: &str,
        schema: V,
        resolver: Option<Resolver<I, O>>,
        config: Option<ProcedureConfig<I, O>>,
    ) -> Self
    where
        I: Clone + Send + Sync + 'static,
        O: Serialize + Send + Sync + 'static,
        V: Validator<Output = I>,
    {
        self.add_method(name, schema, resolver, config)
    }

    /// Add an already defined procedure under the local key `name`.
    pub fn add_procedure<P: DynProcedure>(mut self, name: &str, procedure: P) -> Self {
        self.entries
            .insert(name.to_string(), Entry::Procedure(Arc::new(procedure)));
        self
    }

    /// Define a single-cursor publication named `{prefix}.{name}`.
    pub fn add_publication<I, V>(
        self,
        name: &str,
        schema: V,
        resolver: Option<Resolver<I, Arc<dyn LiveSource>>>,
        config: Option<PublicationConfig<I>>,
    ) -> Self
    where
        I: Clone + Send + Sync + 'static,
        V: Validator<Output = I>,
    {
        let publication = Publication::define(self.qualify(name), schema, resolver, config);
        self.add_existing_publication(name, publication)
    }

    /// Define a multi-cursor publication named `{prefix}.{name}`.
    pub fn add_shared_publication<I, V>(
        self,
        name: &str,
        schema: V,
        resolver: Option<Resolver<I, Cursors>>,
        config: Option<PublicationConfig<I>>,
    ) -> Self
    where
        I: Clone + Send + Sync + 'static,
        V: Validator<Output = I>,
    {
        let publication = Publication::define_shared(self.qualify(name), schema, resolver, config);
        self.add_existing_publication(name, publication)
    }

    /// Add an already defined publication under the local key `name`.
    pub fn add_existing_publication<P: DynPublication>(mut self, name: &str, publication: P) -> Self {
        self.entries
            .insert(name.to_string(), Entry::Publication(Arc::new(publication)));
        self
    }

    /// Nest the finalized entries of another module under `name`.
    ///
    /// Leaf names are not rewritten; build the submodule with a prefix that
    /// already includes this module's prefix (see [`Module::child`]).
    pub fn add_submodule(mut self, name: &str, entries: ModuleEntries) -> Self {
        self.entries.insert(name.to_string(), Entry::Module(entries));
        self
    }

    /// Queue before-hooks applied to every leaf at build time.
    pub fn add_middlewares(mut self, middlewares: impl IntoIterator<Item = Middleware>) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    /// Apply queued middlewares and finalize the entries.
    pub fn build(self) -> ModuleEntries {
        self.entries.apply_middlewares(&self.middlewares);
        debug!(
            "Built module {} ({} entries)",
            self.prefix.as_deref().unwrap_or("<root>"),
            self.entries.len()
        );
        self.entries
    }

    /// Build for nesting: the last prefix segment and the entries.
    pub fn build_submodule(self) -> (String, ModuleEntries) {
        let key = self
            .prefix
            .as_deref()
            .and_then(|p| p.rsplit(RegistryConfig::NAME_SEPARATOR).next())
            .unwrap_or_default()
            .to_string();
        (key, self.build())
    }

    /// Build and return a binder for resolvers supplied later.
    pub fn safe_build(self) -> (ModuleEntries, ResolverBinder) {
        let entries = self.build();
        let binder = ResolverBinder {
            entries: entries.clone(),
        };
        (entries, binder)
    }
}

/// Resolvers keyed by module-local path, for [`ResolverBinder::set_resolvers`].
#[derive(Default)]
pub struct ResolverSet {
    resolvers: Vec<(String, Option<Box<dyn Any + Send>>)>,
}

impl ResolverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver for the member at `key`. Publications take
    /// `Resolver<I, Arc<dyn LiveSource>>` or `Resolver<I, Cursors>`.
    pub fn with<I, O>(mut self, key: &str, resolver: Resolver<I, O>) -> Self
    where
        I: 'static,
        O: 'static,
    {
        self.resolvers.push((key.to_string(), Some(Box::new(resolver))));
        self
    }

    /// A key listed without an implementation.
    pub fn undefined(mut self, key: &str) -> Self {
        self.resolvers.push((key.to_string(), None));
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

/// Wires resolvers into the members of a module built with
/// [`Module::safe_build`].
#[derive(Clone)]
pub struct ResolverBinder {
    entries: ModuleEntries,
}

impl ResolverBinder {
    /// Bind every resolver of `set`.
    ///
    /// The whole set is checked first; on any error nothing is bound.
    pub fn set_resolvers(&self, set: ResolverSet) -> Result<()> {
        for (key, resolver) in &set.resolvers {
            let entry = self.entries.get(key).ok_or_else(|| RpcError::NotFound {
                name: key.clone(),
            })?;
            let resolver = resolver
                .as_deref()
                .ok_or_else(|| RpcError::UndefinedResolver { name: key.clone() })?;
            let accepted = match entry {
                Entry::Procedure(p) => p.accepts_resolver(resolver),
                Entry::Publication(p) => p.accepts_resolver(resolver),
                Entry::Module(_) => {
                    return Err(RpcError::NotFound { name: key.clone() });
                }
            };
            if !accepted {
                return Err(RpcError::ResolverTypeMismatch { name: key.clone() });
            }
        }

        for (key, resolver) in set.resolvers {
            // Presence was checked above.
            let (Some(entry), Some(resolver)) = (self.entries.get(&key), resolver) else {
                continue;
            };
            match entry {
                Entry::Procedure(p) => p.bind_resolver(resolver)?,
                Entry::Publication(p) => p.bind_resolver(resolver)?,
                Entry::Module(_) => {}
            }
            debug!("Bound resolver for {}", key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hooks::MiddlewareContext;
    use crate::schema::{json, NoArgs};
    use serde_json::json;
    use std::sync::Mutex;

    fn math() -> Module {
        Module::new("math").add_method(
            "sum",
            json::<(i64, i64)>(),
            Some(Resolver::from_fn(|(a, b): (i64, i64)| Ok(a + b))),
            None,
        )
    }

    #[test]
    fn test_prefixed_names() {
        let entries = math().build();
        assert_eq!(entries.names(), vec!["math.sum"]);

        let root = Module::root()
            .add_method("ping", NoArgs, Some(Resolver::from_fn(|()| Ok("pong"))), None)
            .build();
        assert_eq!(root.names(), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_nested_submodule() {
        let parent = Module::new("math");
        let (key, trig) = parent
            .child("trig")
            .add_method("sin", json::<f64>(), Some(Resolver::from_fn(|x: f64| Ok(x.sin()))), None)
            .build_submodule();
        assert_eq!(key, "trig");

        let entries = math().add_submodule(&key, trig).build();
        let mut names = entries.names();
        names.sort();
        assert_eq!(names, vec!["math.sum", "math.trig.sin"]);

        let sin = entries.procedure::<f64, f64>("trig.sin").unwrap();
        assert_eq!(sin.name(), "math.trig.sin");
        assert_eq!(sin.invoke(json!(0.0)).await.unwrap(), 0.0);
        assert!(entries.procedure::<i64, i64>("trig.sin").is_none());
    }

    #[tokio::test]
    async fn test_middlewares_reach_nested_leaves() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let audit: Middleware = Arc::new(move |ctx: &MiddlewareContext<'_>| {
            captured.lock().unwrap().push(ctx.name.to_string());
            Ok(())
        });

        let (key, trig) = Module::new("math.trig")
            .add_method("cos", json::<f64>(), Some(Resolver::from_fn(|x: f64| Ok(x.cos()))), None)
            .build_submodule();
        let entries = math()
            .add_submodule(&key, trig)
            .add_middlewares([audit])
            .build();

        entries
            .procedure::<(i64, i64), i64>("sum")
            .unwrap()
            .invoke(json!([1, 2]))
            .await
            .unwrap();
        entries
            .procedure::<f64, f64>("trig.cos")
            .unwrap()
            .invoke(json!(0.0))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["math.sum", "math.trig.cos"]);
    }

    #[tokio::test]
    async fn test_middleware_can_reject() {
        let deny: Middleware = Arc::new(|_ctx: &MiddlewareContext<'_>| Err("unauthorized".into()));
        let entries = math().add_middlewares([deny]).build();
        let err = entries
            .procedure::<(i64, i64), i64>("sum")
            .unwrap()
            .invoke(json!([1, 2]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolver);
    }

    #[tokio::test]
    async fn test_safe_build_binds_later() {
        let (entries, binder) = Module::new("math")
            .add_method::<(i64, i64), i64, _>("sum", json::<(i64, i64)>(), None, None)
            .safe_build();
        let sum = entries.procedure::<(i64, i64), i64>("sum").unwrap();
        assert_eq!(
            sum.invoke(json!([1, 2])).await.unwrap_err().kind(),
            ErrorKind::NotImplemented
        );

        binder
            .set_resolvers(
                ResolverSet::new().with("sum", Resolver::from_fn(|(a, b): (i64, i64)| Ok(a + b))),
            )
            .unwrap();
        assert_eq!(sum.invoke(json!([1, 2])).await.unwrap(), 3);
    }

    #[test]
    fn test_binder_errors() {
        let (_, binder) = math().safe_build();

        let err = binder
            .set_resolvers(ResolverSet::new().with("missing", Resolver::from_fn(|n: i64| Ok(n))))
            .unwrap_err();
        assert!(matches!(err, RpcError::NotFound { .. }));

        let err = binder
            .set_resolvers(ResolverSet::new().undefined("sum"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UndefinedResolver);

        let err = binder
            .set_resolvers(ResolverSet::new().with("sum", Resolver::from_fn(|s: String| Ok(s))))
            .unwrap_err();
        assert!(matches!(err, RpcError::ResolverTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_failed_binding_binds_nothing() {
        let (entries, binder) = Module::new("m")
            .add_method::<i64, i64, _>("a", json::<i64>(), None, None)
            .safe_build();
        let result = binder.set_resolvers(
            ResolverSet::new()
                .with("a", Resolver::from_fn(|n: i64| Ok(n)))
                .undefined("b"),
        );
        assert!(result.is_err());
        assert!(!entries.procedure::<i64, i64>("a").unwrap().has_resolver());
    }

    #[test]
    fn test_modules_are_values() {
        let base = Module::new("todos");
        let extended = base
            .clone()
            .add_method("count", NoArgs, Some(Resolver::from_fn(|()| Ok(0))), None);
        assert!(base.build().is_empty());
        assert_eq!(extended.build().len(), 1);
    }
}
