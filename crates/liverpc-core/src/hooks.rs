//! Lifecycle hooks around a resolver.
//!
//! Each procedure and publication owns a [`HookSet`]: three append-only lists
//! run in insertion order. Before and after hooks may fail; a failure is
//! reported exactly like a resolver failure. Error hooks observe the failure
//! and cannot change it.

use crate::error::{BoxError, RpcError};
use crate::locks;
use serde_json::Value;
use std::any::Any;
use std::sync::{Arc, RwLock};

/// Outcome of a before/after hook or middleware.
pub type HookResult = std::result::Result<(), BoxError>;

/// Runs after validation with `(raw, parsed)`.
pub type BeforeHook<I> = Arc<dyn Fn(&Value, &I) -> HookResult + Send + Sync>;

/// Runs after a successful resolve with `(raw, parsed, result)`.
pub type AfterHook<I, O> = Arc<dyn Fn(&Value, &I, &O) -> HookResult + Send + Sync>;

/// Runs on any failure with `(error, raw, parsed)`; `parsed` is absent when
/// validation itself failed.
pub type ErrorHook<I> = Arc<dyn Fn(&RpcError, &Value, Option<&I>) + Send + Sync>;

/// Type-erased before-hook applied across every leaf of a module.
pub type Middleware = Arc<dyn Fn(&MiddlewareContext<'_>) -> HookResult + Send + Sync>;

/// What a middleware sees of one invocation.
pub struct MiddlewareContext<'a> {
    /// Fully qualified procedure or publication name.
    pub name: &'a str,
    pub raw: &'a Value,
    parsed: &'a (dyn Any + Send + Sync),
}

impl<'a> MiddlewareContext<'a> {
    pub(crate) fn new(name: &'a str, raw: &'a Value, parsed: &'a (dyn Any + Send + Sync)) -> Self {
        Self { name, raw, parsed }
    }

    /// The parsed input, if it is a `T`.
    pub fn parsed<T: Any>(&self) -> Option<&T> {
        self.parsed.downcast_ref::<T>()
    }
}

/// Initial hook lists supplied at definition time.
pub struct Hooks<I, O> {
    pub on_before_resolve: Vec<BeforeHook<I>>,
    pub on_after_resolve: Vec<AfterHook<I, O>>,
    pub on_error_resolve: Vec<ErrorHook<I>>,
}

impl<I, O> Default for Hooks<I, O> {
    fn default() -> Self {
        Self {
            on_before_resolve: Vec::new(),
            on_after_resolve: Vec::new(),
            on_error_resolve: Vec::new(),
        }
    }
}

/// The live hook lists of one procedure or publication.
pub struct HookSet<I, O> {
    before: RwLock<Vec<BeforeHook<I>>>,
    after: RwLock<Vec<AfterHook<I, O>>>,
    error: RwLock<Vec<ErrorHook<I>>>,
}

impl<I, O> Default for HookSet<I, O> {
    fn default() -> Self {
        Self::from(Hooks::default())
    }
}

impl<I, O> From<Hooks<I, O>> for HookSet<I, O> {
    fn from(hooks: Hooks<I, O>) -> Self {
        Self {
            before: RwLock::new(hooks.on_before_resolve),
            after: RwLock::new(hooks.on_after_resolve),
            error: RwLock::new(hooks.on_error_resolve),
        }
    }
}

impl<I, O> HookSet<I, O> {
    pub fn add_before(&self, hook: BeforeHook<I>) {
        locks::write(&self.before).push(hook);
    }

    pub fn add_after(&self, hook: AfterHook<I, O>) {
        locks::write(&self.after).push(hook);
    }

    pub fn add_error(&self, hook: ErrorHook<I>) {
        locks::write(&self.error).push(hook);
    }

    /// Number of `(before, after, error)` hooks.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            locks::read(&self.before).len(),
            locks::read(&self.after).len(),
            locks::read(&self.error).len(),
        )
    }

    // Hooks run against a snapshot so a hook may register further hooks
    // without deadlocking; those apply from the next invocation.

    pub(crate) fn run_before(&self, raw: &Value, parsed: &I) -> Result<(), RpcError> {
        let hooks = locks::read(&self.before).clone();
        for hook in hooks {
            hook(raw, parsed).map_err(RpcError::from_boxed)?;
        }
        Ok(())
    }

    pub(crate) fn run_after(&self, raw: &Value, parsed: &I, result: &O) -> Result<(), RpcError> {
        let hooks = locks::read(&self.after).clone();
        for hook in hooks {
            hook(raw, parsed, result).map_err(RpcError::from_boxed)?;
        }
        Ok(())
    }

    pub(crate) fn run_error(&self, error: &RpcError, raw: &Value, parsed: Option<&I>) {
        let hooks = locks::read(&self.error).clone();
        for hook in hooks {
            hook(error, raw, parsed);
        }
    }
}

/// Adapt a module middleware into a typed before-hook for the leaf `name`.
pub(crate) fn middleware_hook<I>(name: String, middleware: Middleware) -> BeforeHook<I>
where
    I: Send + Sync + 'static,
{
    Arc::new(move |raw: &Value, parsed: &I| {
        middleware(&MiddlewareContext::new(&name, raw, parsed))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_before_hooks_run_in_insertion_order() {
        let hooks: HookSet<i64, i64> = HookSet::default();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for label in ["h1", "h2", "h3"] {
            let calls = calls.clone();
            hooks.add_before(Arc::new(move |_raw, parsed| {
                calls.lock().unwrap().push(format!("{}:{}", label, parsed));
                Ok(())
            }));
        }

        hooks.run_before(&json!(7), &7).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["h1:7", "h2:7", "h3:7"]);
    }

    #[test]
    fn test_failing_before_hook_stops_the_chain() {
        let hooks: HookSet<i64, i64> = HookSet::default();
        let reached = Arc::new(Mutex::new(false));

        hooks.add_before(Arc::new(|_, _| Err("denied".into())));
        let flag = reached.clone();
        hooks.add_before(Arc::new(move |_, _| {
            *flag.lock().unwrap() = true;
            Ok(())
        }));

        let err = hooks.run_before(&json!(1), &1).unwrap_err();
        assert!(matches!(err, RpcError::Resolver { ref message } if message == "denied"));
        assert!(!*reached.lock().unwrap());
    }

    #[test]
    fn test_hook_may_register_hooks_while_running() {
        let hooks: Arc<HookSet<i64, i64>> = Arc::new(HookSet::default());
        let inner = hooks.clone();
        hooks.add_before(Arc::new(move |_, _| {
            inner.add_before(Arc::new(|_, _| Ok(())));
            Ok(())
        }));

        hooks.run_before(&json!(1), &1).unwrap();
        assert_eq!(hooks.counts().0, 2);
    }

    #[test]
    fn test_initial_hooks_from_config() {
        let before: BeforeHook<i64> = Arc::new(|_, _| Ok(()));
        let after: AfterHook<i64, i64> = Arc::new(|_, _, _| Ok(()));
        let hooks: HookSet<i64, i64> = HookSet::from(Hooks {
            on_before_resolve: vec![before],
            on_after_resolve: vec![after.clone(), after],
            on_error_resolve: Vec::new(),
        });
        assert_eq!(hooks.counts(), (1, 2, 0));
    }

    #[test]
    fn test_middleware_sees_parsed_value() {
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let middleware: Middleware = Arc::new(move |ctx| {
            *captured.lock().unwrap() = ctx.parsed::<i64>().copied();
            assert_eq!(ctx.name, "math.double");
            Ok(())
        });

        let hook = middleware_hook::<i64>("math.double".to_string(), middleware);
        hook(&json!(21), &21).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(21));
    }
}
