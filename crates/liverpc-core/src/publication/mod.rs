//! Reactive publications.
//!
//! A [`Publication`] has the same lifecycle as a procedure, but its resolver
//! returns live sources ("cursors") instead of a value. Subscribing attaches
//! an observer to every cursor and turns their row changes into a
//! [`PublicationEvent`] stream: `added` for every existing row, `ready`, then
//! `added` / `changed` / `removed` as rows enter, change and leave, all tagged
//! with the publication's mirror name.
//!
//! Failures before the cursors exist go through the error hooks and are
//! returned to the subscriber. Failures reported by a cursor afterwards stop
//! the subscription and arrive as a final `Error` event.

mod event;
pub mod memory;
mod observer;
mod source;
mod subscription;

pub use event::PublicationEvent;
pub use source::{ChangeSink, Cursors, Fields, LiveSource, StopHandle};
pub use subscription::Subscription;

use crate::config::RateLimit;
use crate::error::{RemoteError, RpcError};
use crate::hooks::{self, AfterHook, BeforeHook, ErrorHook, HookSet, Hooks, Middleware};
use crate::resolver::{Resolver, ResolverCell};
use crate::schema::Validator;
use crate::transport::Transport;
use async_trait::async_trait;
use observer::ObserverBinding;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Options supplied when a publication is defined.
pub struct PublicationConfig<I> {
    pub rate_limit: Option<RateLimit>,
    pub hooks: Hooks<I, Cursors>,
    /// Mirror container the events apply to. Defaults to the publication name.
    pub mirror_name: Option<String>,
}

impl<I> Default for PublicationConfig<I> {
    fn default() -> Self {
        Self {
            rate_limit: None,
            hooks: Hooks::default(),
            mirror_name: None,
        }
    }
}

struct PublicationInner<I> {
    name: String,
    mirror: String,
    schema: Arc<dyn Validator<Output = I>>,
    resolver: ResolverCell<I, Cursors>,
    hooks: HookSet<I, Cursors>,
    rate_limit: Option<RateLimit>,
}

/// Handle to a named publication taking `I`.
pub struct Publication<I> {
    inner: Arc<PublicationInner<I>>,
}

impl<I> Clone for Publication<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I> fmt::Debug for Publication<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("name", &self.inner.name)
            .field("mirror", &self.inner.mirror)
            .field("bound", &self.inner.resolver.is_bound())
            .finish()
    }
}

impl<I> Publication<I>
where
    I: Clone + Send + Sync + 'static,
{
    /// Define a publication whose resolver yields a single cursor.
    pub fn define<V>(
        name: impl Into<String>,
        schema: V,
        resolver: Option<Resolver<I, Arc<dyn LiveSource>>>,
        config: Option<PublicationConfig<I>>,
    ) -> Self
    where
        V: Validator<Output = I>,
    {
        let resolver = resolver.map(|r| r.map_output(|cursor| vec![cursor]));
        Self::from_parts(name.into(), Arc::new(schema), resolver, config.unwrap_or_default())
    }

    /// Define a publication whose resolver yields several cursors fanned
    /// into one mirror.
    pub fn define_shared<V>(
        name: impl Into<String>,
        schema: V,
        resolver: Option<Resolver<I, Cursors>>,
        config: Option<PublicationConfig<I>>,
    ) -> Self
    where
        V: Validator<Output = I>,
    {
        Self::from_parts(name.into(), Arc::new(schema), resolver, config.unwrap_or_default())
    }

    fn from_parts(
        name: String,
        schema: Arc<dyn Validator<Output = I>>,
        resolver: Option<Resolver<I, Cursors>>,
        config: PublicationConfig<I>,
    ) -> Self {
        let mirror = config.mirror_name.unwrap_or_else(|| name.clone());
        Self {
            inner: Arc::new(PublicationInner {
                name,
                mirror,
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

    pub fn mirror_name(&self) -> &str {
        &self.inner.mirror
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.inner.rate_limit
    }

    pub fn hooks(&self) -> &HookSet<I, Cursors> {
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
        F: Fn(&Value, &I, &Cursors) -> hooks::HookResult + Send + Sync + 'static,
    {
        self.inner.hooks.add_after(Arc::new(hook) as AfterHook<I, Cursors>);
        self
    }

    pub fn add_error_hook<F>(&self, hook: F) -> &Self
    where
        F: Fn(&RpcError, &Value, Option<&I>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_error(Arc::new(hook) as ErrorHook<I>);
        self
    }

    pub fn set_resolver(&self, resolver: Resolver<I, Arc<dyn LiveSource>>) -> &Self {
        self.set_shared_resolver(resolver.map_output(|cursor| vec![cursor]))
    }

    pub fn set_shared_resolver(&self, resolver: Resolver<I, Cursors>) -> &Self {
        self.inner.resolver.set(&self.inner.name, resolver);
        self
    }

    pub fn has_resolver(&self) -> bool {
        self.inner.resolver.is_bound()
    }

    /// Open a subscription locally against raw input.
    pub async fn open(&self, raw: Value) -> Result<Subscription, RpcError> {
        let parsed = match self.inner.schema.parse(&raw) {
            Ok(parsed) => parsed,
            Err(e) => return Err(self.fail(e.into(), &raw, None)),
        };

        let cursors = match self.resolve(&raw, &parsed).await {
            Ok(cursors) => cursors,
            Err(e) => return Err(self.fail(e, &raw, Some(&parsed))),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let binding = Arc::new(ObserverBinding::new(
            self.inner.name.clone(),
            self.inner.mirror.clone(),
            tx,
        ));

        for cursor in cursors {
            match cursor.observe(binding.clone()).await {
                Ok(handle) => binding.attach(handle),
                Err(e) => {
                    binding.stop();
                    return Err(self.fail(e, &raw, Some(&parsed)));
                }
            }
        }
        binding.mark_ready();
        info!("Subscription to {} opened", self.inner.name);

        let stop = StopHandle::new(move || binding.stop());
        Ok(Subscription::new(
            self.inner.name.clone(),
            self.inner.mirror.clone(),
            rx,
            stop,
        ))
    }

    async fn resolve(&self, raw: &Value, parsed: &I) -> Result<Cursors, RpcError> {
        self.inner.hooks.run_before(raw, parsed)?;

        let resolver = self
            .inner
            .resolver
            .get()
            .ok_or_else(|| RpcError::NotImplemented {
                name: self.inner.name.clone(),
            })?;
        let cursors = resolver
            .run(parsed.clone())
            .await
            .map_err(RpcError::from_boxed)?;

        self.inner.hooks.run_after(raw, parsed, &cursors)?;
        Ok(cursors)
    }

    fn fail(&self, error: RpcError, raw: &Value, parsed: Option<&I>) -> RpcError {
        warn!("{} failed ({}): {}", self.inner.name, error.kind(), error);
        self.inner.hooks.run_error(&error, raw, parsed);
        error
    }
}

impl<I> Publication<I>
where
    I: Clone + Serialize + Send + Sync + 'static,
{
    /// Subscribe through `transport`.
    pub async fn subscribe<T>(&self, transport: &T, input: &I) -> Result<Subscription, RemoteError>
    where
        T: Transport + ?Sized,
    {
        let args = vec![serde_json::to_value(input)?];
        transport.subscribe(&self.inner.name, args).await
    }
}

/// Type-erased view of a publication, as stored by registries and modules.
#[async_trait]
pub trait DynPublication: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn mirror_name(&self) -> &str;

    fn rate_limit(&self) -> Option<RateLimit>;

    fn has_resolver(&self) -> bool;

    async fn open_value(&self, raw: Value) -> Result<Subscription, RpcError>;

    fn add_middleware(&self, middleware: Middleware);

    fn accepts_resolver(&self, resolver: &(dyn Any + Send)) -> bool;

    /// Bind a boxed `Resolver<I, Cursors>` or `Resolver<I, Arc<dyn LiveSource>>`.
    fn bind_resolver(&self, resolver: Box<dyn Any + Send>) -> Result<(), RpcError>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<I> DynPublication for Publication<I>
where
    I: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        Publication::name(self)
    }

    fn mirror_name(&self) -> &str {
        Publication::mirror_name(self)
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        Publication::rate_limit(self)
    }

    fn has_resolver(&self) -> bool {
        Publication::has_resolver(self)
    }

    async fn open_value(&self, raw: Value) -> Result<Subscription, RpcError> {
        self.open(raw).await
    }

    fn add_middleware(&self, middleware: Middleware) {
        self.inner
            .hooks
            .add_before(hooks::middleware_hook(self.inner.name.clone(), middleware));
    }

    fn accepts_resolver(&self, resolver: &(dyn Any + Send)) -> bool {
        resolver.is::<Resolver<I, Cursors>>() || resolver.is::<Resolver<I, Arc<dyn LiveSource>>>()
    }

    fn bind_resolver(&self, resolver: Box<dyn Any + Send>) -> Result<(), RpcError> {
        let resolver = match resolver.downcast::<Resolver<I, Cursors>>() {
            Ok(shared) => {
                self.set_shared_resolver(*shared);
                return Ok(());
            }
            Err(other) => other,
        };
        match resolver.downcast::<Resolver<I, Arc<dyn LiveSource>>>() {
            Ok(single) => {
                self.set_resolver(*single);
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
