//! The authoritative procedure and publication registry.
//!
//! Whichever process owns a [`Registry`] executes the procedures and
//! publications registered on it; transport servers dispatch into it.

use crate::config::{OverwritePolicy, RateLimit, RegistryConfig};
use crate::error::{Result, RpcError};
use crate::locks;
use crate::module::ModuleEntries;
use crate::procedure::DynProcedure;
use crate::publication::{DynPublication, Subscription};
use crate::rate_limit::{LimitKind, RateLimiter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Builder for [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    overwrite_policy: OverwritePolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// What happens when a name is registered twice.
    pub fn overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite_policy = policy;
        self
    }

    /// Share a rate limiter with other registries.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            procedures: RwLock::new(HashMap::new()),
            publications: RwLock::new(HashMap::new()),
            policy: self.overwrite_policy,
            limiter: self.rate_limiter.unwrap_or_default(),
        }
    }
}

/// Named procedures and publications of the authoritative process.
pub struct Registry {
    procedures: RwLock<HashMap<String, Arc<dyn DynProcedure>>>,
    publications: RwLock<HashMap<String, Arc<dyn DynPublication>>>,
    policy: OverwritePolicy,
    limiter: Arc<RateLimiter>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        RegistryBuilder::new().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn overwrite_policy(&self) -> OverwritePolicy {
        self.policy
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Register a procedure, e.g. a `Procedure<I, O>` handle.
    pub fn register_procedure<P>(&self, procedure: P) -> Result<()>
    where
        P: DynProcedure,
    {
        self.insert_procedure(Arc::new(procedure))
    }

    /// Register a publication, e.g. a `Publication<I>` handle.
    pub fn register_publication<P>(&self, publication: P) -> Result<()>
    where
        P: DynPublication,
    {
        self.insert_publication(Arc::new(publication))
    }

    /// Register every leaf of a built module.
    pub fn mount(&self, entries: &ModuleEntries) -> Result<()> {
        for procedure in entries.procedures() {
            self.insert_procedure(procedure)?;
        }
        for publication in entries.publications() {
            self.insert_publication(publication)?;
        }
        Ok(())
    }

    pub(crate) fn insert_procedure(&self, procedure: Arc<dyn DynProcedure>) -> Result<()> {
        let name = procedure.name().to_string();
        check_reserved(&name)?;
        let limit = procedure.rate_limit();
        if let Some(limit) = limit {
            RateLimiter::validate(&name, limit)?;
        }

        let mut procedures = locks::write(&self.procedures);
        self.check_overwrite("procedure", &name, procedures.contains_key(&name))?;
        procedures.insert(name.clone(), procedure);
        drop(procedures);

        self.apply_limit(LimitKind::Method, &name, limit)?;
        debug!("Registered procedure {}", name);
        Ok(())
    }

    pub(crate) fn insert_publication(&self, publication: Arc<dyn DynPublication>) -> Result<()> {
        let name = publication.name().to_string();
        check_reserved(&name)?;
        let limit = publication.rate_limit();
        if let Some(limit) = limit {
            RateLimiter::validate(&name, limit)?;
        }

        let mut publications = locks::write(&self.publications);
        self.check_overwrite("publication", &name, publications.contains_key(&name))?;
        publications.insert(name.clone(), publication);
        drop(publications);

        self.apply_limit(LimitKind::Subscription, &name, limit)?;
        debug!("Registered publication {}", name);
        Ok(())
    }

    fn check_overwrite(&self, what: &str, name: &str, exists: bool) -> Result<()> {
        if !exists {
            return Ok(());
        }
        match self.policy {
            OverwritePolicy::Replace => {
                warn!("Replacing {} {}", what, name);
                Ok(())
            }
            OverwritePolicy::Reject => Err(RpcError::DuplicateName {
                name: name.to_string(),
            }),
        }
    }

    fn apply_limit(&self, kind: LimitKind, name: &str, limit: Option<RateLimit>) -> Result<()> {
        match limit {
            Some(limit) => self.limiter.configure(kind, name, limit),
            None => {
                self.limiter.remove(kind, name);
                Ok(())
            }
        }
    }

    pub fn procedure(&self, name: &str) -> Option<Arc<dyn DynProcedure>> {
        locks::read(&self.procedures).get(name).cloned()
    }

    pub fn publication(&self, name: &str) -> Option<Arc<dyn DynPublication>> {
        locks::read(&self.publications).get(name).cloned()
    }

    /// Registered procedure names, sorted.
    pub fn procedure_names(&self) -> Vec<String> {
        let mut names: Vec<String> = locks::read(&self.procedures).keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered publication names, sorted.
    pub fn publication_names(&self) -> Vec<String> {
        let mut names: Vec<String> = locks::read(&self.publications).keys().cloned().collect();
        names.sort();
        names
    }

    /// Mirror container name of a publication.
    pub fn mirror_name(&self, publication: &str) -> Result<String> {
        self.publication(publication)
            .map(|p| p.mirror_name().to_string())
            .ok_or_else(|| RpcError::NotFound {
                name: publication.to_string(),
            })
    }

    /// Invoke a procedure (or built-in) with raw input.
    pub async fn call(&self, name: &str, input: Value) -> Result<Value> {
        if let Some(result) = self.call_builtin(name, &input) {
            return result;
        }

        let procedure = self.procedure(name).ok_or_else(|| RpcError::NotFound {
            name: name.to_string(),
        })?;
        self.limiter.check(LimitKind::Method, name)?;
        procedure.invoke_value(input).await
    }

    /// Open a subscription with raw input.
    pub async fn subscribe(&self, name: &str, input: Value) -> Result<Subscription> {
        let publication = self.publication(name).ok_or_else(|| RpcError::NotFound {
            name: name.to_string(),
        })?;
        self.limiter.check(LimitKind::Subscription, name)?;
        info!("Opening subscription to {}", name);
        publication.open_value(input).await
    }

    fn call_builtin(&self, name: &str, input: &Value) -> Option<Result<Value>> {
        match name {
            RegistryConfig::HEALTH_METHOD => Some(Ok(json!({"status": "ok"}))),
            RegistryConfig::MIRROR_NAME_METHOD => {
                let publication = match input {
                    Value::String(name) => name.as_str(),
                    _ => {
                        return Some(Err(RpcError::Validation {
                            message: "Expected a publication name".to_string(),
                        }))
                    }
                };
                Some(self.mirror_name(publication).map(Value::String))
            }
            _ => None,
        }
    }
}

fn check_reserved(name: &str) -> Result<()> {
    if name.starts_with(RegistryConfig::RESERVED_PREFIX) {
        return Err(RpcError::ReservedName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::filter::Filter;
    use crate::procedure::{Procedure, ProcedureConfig};
    use crate::publication::memory::MemoryCollection;
    use crate::publication::{LiveSource, Publication, PublicationConfig};
    use crate::resolver::Resolver;
    use crate::schema::{json, NoArgs};
    use std::time::Duration;

    fn double() -> Procedure<i64, i64> {
        Procedure::define(
            "math.double",
            json::<i64>(),
            Some(Resolver::from_fn(|n: i64| Ok(n * 2))),
            None,
        )
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let registry = Registry::new();
        registry.register_procedure(double()).unwrap();
        assert_eq!(registry.call("math.double", json!(21)).await.unwrap(), json!(42));
        assert_eq!(registry.procedure_names(), vec!["math.double"]);
    }

    #[tokio::test]
    async fn test_unknown_name() {
        let registry = Registry::new();
        let err = registry.call("nope", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = registry.subscribe("nope", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_overwrite_policies() {
        let registry = Registry::new();
        registry.register_procedure(double()).unwrap();
        registry
            .register_procedure(Procedure::define(
                "math.double",
                json::<i64>(),
                Some(Resolver::from_fn(|n: i64| Ok(n * 4))),
                None,
            ))
            .unwrap();
        assert_eq!(registry.call("math.double", json!(1)).await.unwrap(), json!(4));

        let strict = Registry::builder()
            .overwrite_policy(OverwritePolicy::Reject)
            .build();
        strict.register_procedure(double()).unwrap();
        assert!(matches!(
            strict.register_procedure(double()),
            Err(RpcError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let registry = Registry::new();
        let reserved: Procedure<(), ()> = Procedure::define("__private", NoArgs, None, None);
        assert!(matches!(
            registry.register_procedure(reserved),
            Err(RpcError::ReservedName { .. })
        ));
    }

    #[tokio::test]
    async fn test_builtins() {
        let registry = Registry::new();
        let todos = MemoryCollection::new("todos");
        let publication: Publication<()> = Publication::define(
            "todos.all",
            NoArgs,
            Some(Resolver::from_fn(move |()| {
                Ok(Arc::new(todos.find(Filter::all())) as Arc<dyn LiveSource>)
            })),
            Some(PublicationConfig {
                mirror_name: Some("todos".into()),
                ..PublicationConfig::default()
            }),
        );
        registry.register_publication(publication).unwrap();

        assert_eq!(
            registry.call("__health", Value::Null).await.unwrap(),
            json!({"status": "ok"})
        );
        assert_eq!(
            registry.call("__mirror_name", json!("todos.all")).await.unwrap(),
            json!("todos")
        );
        let err = registry.call("__mirror_name", json!("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_rate_limited_before_validation() {
        let registry = Registry::new();
        let limited = Procedure::define(
            "limited",
            json::<i64>(),
            Some(Resolver::from_fn(Ok)),
            Some(ProcedureConfig {
                rate_limit: Some(RateLimit::new(Duration::from_secs(60), 1)),
                ..ProcedureConfig::default()
            }),
        );
        registry.register_procedure(limited).unwrap();

        assert_eq!(registry.call("limited", json!(1)).await.unwrap(), json!(1));
        let err = registry.call("limited", json!("not a number")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    }

    #[tokio::test]
    async fn test_invalid_rate_limit_registers_nothing() {
        let registry = Registry::new();
        let zero_budget = |name: &str| {
            Procedure::define(
                name,
                json::<i64>(),
                Some(Resolver::from_fn(|n: i64| Ok(n * 10))),
                Some(ProcedureConfig {
                    rate_limit: Some(RateLimit::new(Duration::from_secs(1), 0)),
                    ..ProcedureConfig::default()
                }),
            )
        };

        let err = registry.register_procedure(zero_budget("bad")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(registry.procedure_names().is_empty());
        let err = registry.call("bad", json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // A failed replacement keeps the previous entry.
        registry.register_procedure(double()).unwrap();
        assert!(registry.register_procedure(zero_budget("math.double")).is_err());
        assert_eq!(registry.call("math.double", json!(3)).await.unwrap(), json!(6));
        assert!(!registry
            .rate_limiter()
            .is_configured(LimitKind::Method, "math.double"));
    }
}
