//! liverpc - typed procedures and reactive publications over pluggable
//! transports.
//!
//! A [`Registry`] holds named [`Procedure`]s (validate, hooks, resolver) and
//! [`Publication`]s (the same lifecycle, but the resolver yields live sources
//! whose changes stream to subscribers as added/changed/removed events).
//! [`Module`] namespaces both under dotted prefixes and lets resolvers be
//! bound after declaration. On the client, [`ClientDispatch`] addresses any
//! name by path and turns invocations into calls, cached queries, mutations
//! or live mirror views.
//!
//! # Example
//!
//! ```rust,ignore
//! use liverpc::{schema::json, ClientDispatch, LocalTransport, Module, Registry, Resolver};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let math = Module::new("math").add_method(
//!         "sum",
//!         json::<(i64, i64)>(),
//!         Some(Resolver::from_fn(|(a, b): (i64, i64)| Ok(a + b))),
//!         None,
//!     );
//!
//!     let registry = Arc::new(Registry::new());
//!     registry.mount(&math.build())?;
//!
//!     let client = ClientDispatch::new(Arc::new(LocalTransport::new(registry)));
//!     if let Some(sum) = client.path("math.sum") {
//!         println!("{}", sum.call(vec![1.into(), 2.into()]).await?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod ipc;
pub mod module;
pub mod procedure;
pub mod publication;
pub mod rate_limit;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod transport;

mod locks;

// Re-export commonly used types
pub use client::{ClientDispatch, DispatchPath, Dispatched, LiveView, MirrorStore, QueryCache, SafeCaller};
pub use config::{HttpConfig, OverwritePolicy, RateLimit};
pub use error::{BoxError, ErrorKind, RemoteError, Result, RpcError};
pub use filter::Filter;
pub use hooks::{HookResult, Hooks, Middleware, MiddlewareContext};
pub use ipc::{IpcClient, IpcServer, IpcServerHandle};
pub use module::{Module, ModuleEntries, ResolverBinder, ResolverSet};
pub use procedure::{DynProcedure, Procedure, ProcedureConfig};
pub use publication::memory::MemoryCollection;
pub use publication::{
    DynPublication, LiveSource, Publication, PublicationConfig, PublicationEvent, StopHandle,
    Subscription,
};
pub use rate_limit::RateLimiter;
pub use registry::{Registry, RegistryBuilder};
pub use resolver::Resolver;
pub use schema::Validator;
pub use transport::{Dispatch, LocalTransport, Transport};
