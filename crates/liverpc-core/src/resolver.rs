//! Resolvers and the rebindable resolver cell.

use crate::error::BoxError;
use crate::locks;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

type SyncFn<I, O> = dyn Fn(I) -> Result<O, BoxError> + Send + Sync;
type AsyncFn<I, O> = dyn Fn(I) -> BoxFuture<'static, Result<O, BoxError>> + Send + Sync;

/// The function doing a procedure's actual work.
///
/// Synchronous resolvers complete inside the invocation; asynchronous ones
/// complete when their future settles. Both report failure as a boxed error.
pub struct Resolver<I, O> {
    kind: ResolverKind<I, O>,
}

enum ResolverKind<I, O> {
    Sync(Arc<SyncFn<I, O>>),
    Async(Arc<AsyncFn<I, O>>),
}

impl<I, O> Clone for Resolver<I, O> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            ResolverKind::Sync(f) => ResolverKind::Sync(f.clone()),
            ResolverKind::Async(f) => ResolverKind::Async(f.clone()),
        };
        Self { kind }
    }
}

impl<I, O> Resolver<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(I) -> Result<O, BoxError> + Send + Sync + 'static,
    {
        Self {
            kind: ResolverKind::Sync(Arc::new(f)),
        }
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
    {
        Self {
            kind: ResolverKind::Async(Arc::new(move |input| f(input).boxed())),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self.kind, ResolverKind::Async(_))
    }

    /// Transform the output of this resolver.
    pub fn map_output<P, F>(self, f: F) -> Resolver<I, P>
    where
        P: Send + 'static,
        F: Fn(O) -> P + Send + Sync + 'static,
    {
        match self.kind {
            ResolverKind::Sync(inner) => Resolver::from_fn(move |input| inner(input).map(&f)),
            ResolverKind::Async(inner) => {
                let f = Arc::new(f);
                Resolver::from_async(move |input| {
                    let fut = inner(input);
                    let f = f.clone();
                    async move { fut.await.map(|out| f(out)) }
                })
            }
        }
    }

    pub(crate) async fn run(&self, input: I) -> Result<O, BoxError> {
        match &self.kind {
            ResolverKind::Sync(f) => f(input),
            ResolverKind::Async(f) => f(input).await,
        }
    }
}

/// Resolver slot read at invocation time, never captured at definition.
pub(crate) struct ResolverCell<I, O> {
    slot: RwLock<Option<Resolver<I, O>>>,
}

impl<I, O> ResolverCell<I, O> {
    pub(crate) fn new(initial: Option<Resolver<I, O>>) -> Self {
        Self {
            slot: RwLock::new(initial),
        }
    }

    pub(crate) fn set(&self, name: &str, resolver: Resolver<I, O>) {
        let previous = locks::write(&self.slot).replace(resolver);
        if previous.is_some() {
            debug!("Rebinding resolver for {}", name);
        }
    }

    pub(crate) fn get(&self) -> Option<Resolver<I, O>> {
        locks::read(&self.slot).clone()
    }

    pub(crate) fn is_bound(&self) -> bool {
        locks::read(&self.slot).is_some()
    }
}
