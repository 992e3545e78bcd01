//! Procedure definitions and the invocation engine.
//!
//! A [`Procedure`] is a named, schema-validated operation. The same handle is
//! used on both sides of a transport: the process owning a
//! [`Registry`](crate::Registry) executes it through [`Procedure::invoke`],
//! everyone else calls it remotely with [`Procedure::call`].
//!
//! # Invocation
//!
//! 1. validate the raw input (failure skips straight to the error phase)
//! 2. run before-hooks with `(raw, parsed)`
//! 3. run the resolver, or fail with `NotImplemented` when none is bound
//! 4. run after-hooks with `(raw, parsed, result)` and return the result
//!
//! Any failure runs the error hooks and is then returned to the caller.

use crate::config::RateLimit;
use crate::error::{RemoteError, RpcError};
use crate::hooks::{self, AfterHook, BeforeHook, ErrorHook, HookSet, Hooks, Middleware};
use crate::resolver::{Resolver, ResolverCell};
use crate::schema::Validator;
use crate::transport::Transport;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Options supplied when a procedure is defined.
pub struct ProcedureConfig<I, O> {
    pub rate_limit: Option<RateLimit>,
    pub hooks: Hooks<I, O>,
}

impl<I, O> Default for ProcedureConfig<I, O> {
    fn default() -> Self {
        Self {
            rate_limit: None,
            hooks: Hooks::default(),
        }
    }
}

struct ProcedureInner<I, O> {
    name: String,
    schema: Arc<dyn Validator<Output = I>>,
    resolver: ResolverCell<I, O>,
    hooks: HookSet<I, O>,
    rate_limit: Option<RateLimit>,
}

/// Handle to a named procedure taking `I` and producing `O`.
///
/// Cloning the handle shares the definition: hooks and resolver bindings made
/// through any clone are seen by all of them.
pub struct Procedure<I, O> {
    inner: Arc<ProcedureInner<I, O>>,
}

impl<I, O> Clone for Procedure<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, O> fmt::Debug for Procedure<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.inner.name)
            .field("bound", &self.inner.resolver.is_bound())
            .finish()
    }
}

/// A procedure whose result type has not been stated yet.
///
/// Produced by [`Procedure::declare`] when the contract is declared in one
/// place and the implementation bound elsewhere.
pub struct Declaration<I> {
    name: String,
    schema: Arc<dyn Validator<Output = I>>,
    rate_limit: Option<RateLimit>,
}

impl<I> Declaration<I>
where
    I: Clone + Send + Sync + 'static,
{
    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// State the result type. No runtime effect.
    pub fn returns<O>(self) -> Procedure<I, O>
    where
        O: Send + Sync + 'static,
    {
        Procedure::from_parts(self.name, self.schema, None, ProcedureConfig {
            rate_limit: self.rate_limit,
            hooks: Hooks::default(),
        })
    }

    /// Alias of [`Declaration::returns`].
    pub fn expect<O>(self) -> Procedure<I, O>
    where
        O: Send + Sync + 'static,
    {
        self.returns()
    }
}

impl Procedure<(), ()> {
    /// Declare a procedure contract without a resolver or result type.
    pub fn declare<V>(name: impl Into<String>, schema: V) -> Declaration<V::Output>
    where
        V: Validator,
        V::Output: Clone,
    {
        Declaration {
            name: name.into(),
            schema: Arc::new(schema),
            rate_limit: None,
        }
    }
}

impl<I, O> Procedure<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Define a procedure.
    ///
    /// `resolver` may be `None` and bound later with [`Procedure::set_resolver`].
    pub fn define<V>(
        name: impl Into<String>,
        schema: V,
        resolver: Option<Resolver<I, O>>,
        config: Option<ProcedureConfig<I, O>>,
    ) -> Self
    where
        V: Validator<Output = I>,
    {
        Self::from_parts(name.into(), Arc::new(schema), resolver, config.unwrap_or_default())
    }

    fn from_parts(
        name: String,
        schema: Arc<dyn Validator<Output = I>>,
        resolver: Option<Resolver<I, O>>,
        config: ProcedureConfig<I, O>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcedureInner {
                name,
                schema,
                resolver: ResolverCell::new(resolver),
                hooks: HookSet::from(config.hooks),
                rate_limit: config.rate_limit,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.inner.rate_limit
    }

    pub fn hooks(&self) -> &HookSet<I, O> {
        &self.inner.hooks
    }

    pub fn add_before_hook<F>(&self, hook: F) -> &Self
    where
        F: Fn(&Value, &I) -> hooks::HookResult + Send + Sync + 'static,
    {
        self.inner.hooks.add_before(Arc::new(hook) as BeforeHook<I>);
        self
    }

    pub fn add_after_hook<F>(&self, hook: F) -> &Self
    where
        F: Fn(&Value, &I, &O) -> hooks::HookResult + Send + Sync + 'static,
    {
        self.inner.hooks.add_after(Arc::new(hook) as AfterHook<I, O>);
        self
    }

    pub fn add_error_hook<F>(&self, hook: F) -> &Self
    where
        F: Fn(&RpcError, &Value, Option<&I>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_error(Arc::new(hook) as ErrorHook<I>);
        self
    }

    /// Bind (or rebind) the resolver. Takes effect from the next invocation.
    pub fn set_resolver(&self, resolver: Resolver<I, O>) -> &Self {
        self.inner.resolver.set(&self.inner.name, resolver);
        self
    }

    pub fn has_resolver(&self) -> bool {
        self.inner.resolver.is_bound()
    }

    /// Execute the procedure locally against raw input.
    pub async fn invoke(&self, raw: Value) -> Result<O, RpcError> {
        self.invoke_then(raw, Ok).await
    }

    /// Like [`Procedure::invoke`], with `finish` applied to the result inside
    /// the error phase.
    async fn invoke_then<T, F>(&self, raw: Value, finish: F) -> Result<T, RpcError>
    where
        F: FnOnce(O) -> Result<T, RpcError>,
    {
        let parsed = match self.inner.schema.parse(&raw) {
            Ok(parsed) => parsed,
            Err(e) => return Err(self.fail(e.into(), &raw, None)),
        };

        match self.resolve(&raw, &parsed).await.and_then(finish) {
            Ok(output) => Ok(output),
            Err(e) => Err(self.fail(e, &raw, Some(&parsed))),
        }
    }

    async fn resolve(&self, raw: &Value, parsed: &I) -> Result<O, RpcError> {
        self.inner.hooks.run_before(raw, parsed)?;

        let resolver = self
            .inner
            .resolver
            .get()
            .ok_or_else(|| RpcError::NotImplemented {
                name: self.inner.name.clone(),
            })?;
        let output = resolver
            .run(parsed.clone())
            .await
            .map_err(RpcError::from_boxed)?;

        self.inner.hooks.run_after(raw, parsed, &output)?;
        Ok(output)
    }

    fn fail(&self, error: RpcError, raw: &Value, parsed: Option<&I>) -> RpcError {
        warn!("{} failed ({}): {}", self.inner.name, error.kind(), error);
        self.inner.hooks.run_error(&error, raw, parsed);
        error
    }
}

impl<I, O> Procedure<I, O>
where
    I: Clone + Serialize + Send + Sync + 'static,
    O: DeserializeOwned + Send + Sync + 'static,
{
    /// Call the procedure through `transport`.
    pub async fn call<T>(&self, transport: &T, input: &I) -> Result<O, RemoteError>
    where
        T: Transport + ?Sized,
    {
        let args = vec![serde_json::to_value(input)?];
        let value = transport.invoke(&self.inner.name, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Type-erased view of a procedure, as stored by registries and modules.
#[async_trait]
pub trait DynProcedure: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn rate_limit(&self) -> Option<RateLimit>;

    fn has_resolver(&self) -> bool;

    /// Execute against raw input and serialize the result.
    async fn invoke_value(&self, raw: Value) -> Result<Value, RpcError>;

    /// Append a module middleware as a before-hook.
    fn add_middleware(&self, middleware: Middleware);

    /// Whether `resolver` has the type this procedure expects.
    fn accepts_resolver(&self, resolver: &(dyn Any + Send)) -> bool;

    /// Bind a boxed `Resolver<I, O>`.
    fn bind_resolver(&self, resolver: Box<dyn Any + Send>) -> Result<(), RpcError>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<I, O> DynProcedure for Procedure<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        Procedure::name(self)
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        Procedure::rate_limit(self)
    }

    fn has_resolver(&self) -> bool {
        Procedure::has_resolver(self)
    }

    async fn invoke_value(&self, raw: Value) -> Result<Value, RpcError> {
        self.invoke_then(raw, |output| Ok(serde_json::to_value(output)?))
            .await
    }

    fn add_middleware(&self, middleware: Middleware) {
        self.inner
            .hooks
            .add_before(hooks::middleware_hook(self.inner.name.clone(), middleware));
    }

    fn accepts_resolver(&self, resolver: &(dyn Any + Send)) -> bool {
        resolver.is::<Resolver<I, O>>()
    }

    fn bind_resolver(&self, resolver: Box<dyn Any + Send>) -> Result<(), RpcError> {
        match resolver.downcast::<Resolver<I, O>>() {
            Ok(resolver) => {
                self.set_resolver(*resolver);
                Ok(())
            }
            Err(_) => Err(RpcError::ResolverTypeMismatch {
                name: self.inner.name.clone(),
            }),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::{json, AnyValue};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_identity_returns_input() {
        let id = Procedure::define("id", json::<i64>(), Some(Resolver::from_fn(Ok)), None);
        assert_eq!(id.invoke(json!(5)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_resolver_and_before_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let proc = Procedure::define(
            "count",
            json::<i64>(),
            Some(Resolver::from_fn(move |n: i64| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(n)
            })),
            None,
        );
        let before_ran = Arc::new(AtomicUsize::new(0));
        let flag = before_ran.clone();
        proc.add_before_hook(move |_, _| {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let parsed_in_error_hook = Arc::new(Mutex::new(None));
        let seen = parsed_in_error_hook.clone();
        proc.add_error_hook(move |err, _raw, parsed| {
            *seen.lock().unwrap() = Some((err.kind(), parsed.is_some()));
        });

        let err = proc.invoke(json!("not a number")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(before_ran.load(Ordering::SeqCst), 0);
        assert_eq!(
            *parsed_in_error_hook.lock().unwrap(),
            Some((ErrorKind::Validation, false))
        );
    }

    #[tokio::test]
    async fn test_before_hooks_run_in_order_before_resolver() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resolver_log = log.clone();
        let proc = Procedure::define(
            "join",
            AnyValue,
            Some(Resolver::from_fn(move |v: Value| {
                resolver_log.lock().unwrap().push(format!("resolver:{}", v));
                Ok(v)
            })),
            None,
        );
        for label in ["H1", "H2"] {
            let log = log.clone();
            proc.add_before_hook(move |_raw, parsed| {
                log.lock().unwrap().push(format!("{}:{}", label, parsed));
                Ok(())
            });
        }

        proc.invoke(json!({"a": 1})).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                r#"H1:{"a":1}"#.to_string(),
                r#"H2:{"a":1}"#.to_string(),
                r#"resolver:{"a":1}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_after_hooks_see_result() {
        let check: AfterHook<(String, String), String> = Arc::new(|_raw, input, out| {
            assert_eq!(input.0, "foo");
            assert_eq!(input.1, "bar");
            assert_eq!(out, "foobar");
            Ok(())
        });
        let proc = Procedure::define(
            "concat",
            json::<(String, String)>(),
            Some(Resolver::from_fn(|(a, b): (String, String)| Ok(a + &b))),
            Some(ProcedureConfig {
                rate_limit: None,
                hooks: Hooks {
                    on_after_resolve: vec![check],
                    ..Hooks::default()
                },
            }),
        );
        let seen = Arc::new(Mutex::new(String::new()));
        let captured = seen.clone();
        proc.add_after_hook(move |_, _, out| {
            *captured.lock().unwrap() = out.clone();
            Ok(())
        });

        assert_eq!(proc.invoke(json!(["foo", "bar"])).await.unwrap(), "foobar");
        assert_eq!(*seen.lock().unwrap(), "foobar");
    }

    #[tokio::test]
    async fn test_deferred_resolver() {
        let sum = Procedure::declare("sum", json::<(i64, i64)>()).returns::<i64>();
        let err = sum.invoke(json!([1, 2])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);

        sum.set_resolver(Resolver::from_fn(|(a, b)| Ok(a + b)));
        assert_eq!(sum.invoke(json!([1, 2])).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_resolver_error_runs_error_hooks_and_propagates() {
        let proc: Procedure<i64, i64> = Procedure::define(
            "err",
            json::<i64>(),
            Some(Resolver::from_fn(|_| Err("err".into()))),
            None,
        );
        let hook_calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = hook_calls.clone();
            proc.add_error_hook(move |err, raw, parsed| {
                assert_eq!(err.to_string(), "Resolver error: err");
                assert_eq!(raw, &json!(1));
                assert_eq!(parsed, Some(&1));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let err = proc.invoke(json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolver);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_resolver() {
        let full_name = Procedure::define(
            "full_name",
            json::<(String, String)>(),
            Some(Resolver::from_async(|(first, last): (String, String)| async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(format!("{} {}", first, last))
            })),
            None,
        );
        assert_eq!(
            full_name.invoke(json!(["first", "last"])).await.unwrap(),
            "first last"
        );
    }

    #[tokio::test]
    async fn test_failing_after_hook_is_an_error() {
        let proc = Procedure::define("after", json::<i64>(), Some(Resolver::from_fn(Ok)), None);
        proc.add_after_hook(|_, _, _| Err("audit log unavailable".into()));
        let err = proc.invoke(json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolver);
    }

    #[tokio::test]
    async fn test_dyn_binding_checks_type() {
        let proc = Procedure::declare("typed", json::<i64>()).returns::<i64>();
        let dyn_proc: &dyn DynProcedure = &proc;

        let wrong: Box<dyn Any + Send> = Box::new(Resolver::<String, String>::from_fn(Ok));
        assert!(!dyn_proc.accepts_resolver(wrong.as_ref()));
        assert!(matches!(
            dyn_proc.bind_resolver(wrong),
            Err(RpcError::ResolverTypeMismatch { .. })
        ));

        let right: Box<dyn Any + Send> = Box::new(Resolver::<i64, i64>::from_fn(|n| Ok(n + 1)));
        dyn_proc.bind_resolver(right).unwrap();
        assert_eq!(dyn_proc.invoke_value(json!(1)).await.unwrap(), json!(2));
    }

    struct NoWireForm;

    impl Serialize for NoWireForm {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("no wire form"))
        }
    }

    #[tokio::test]
    async fn test_unserializable_result_runs_error_hooks() {
        let proc = Procedure::define(
            "opaque",
            json::<i64>(),
            Some(Resolver::from_fn(|_: i64| Ok(NoWireForm))),
            None,
        );
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        proc.add_error_hook(move |err, _raw, parsed| {
            assert_eq!(err.kind(), ErrorKind::Internal);
            assert_eq!(parsed, Some(&7));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let dyn_proc: &dyn DynProcedure = &proc;
        let err = dyn_proc.invoke_value(json!(7)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
