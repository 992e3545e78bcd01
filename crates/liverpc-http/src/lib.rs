//! HTTP adapter for liverpc.
//!
//! Serves any [`Dispatch`](liverpc::Dispatch) (usually a
//! [`Registry`](liverpc::Registry)) over HTTP and provides the matching client
//! [`Transport`](liverpc::Transport).
//!
//! # Endpoints
//!
//! - `GET /health` - liveness check
//! - `POST /rpc` - JSON-RPC 2.0 calls, params are positional arguments
//! - `GET /subscribe/{name}?args=[...]` - server-sent events, one JSON
//!   publication event per message; the mirror container name is returned
//!   in the `x-liverpc-mirror` header
//!
//! # Example
//!
//! ```rust,ignore
//! let addr = liverpc_http::start_server(registry, "127.0.0.1", 0).await?;
//! let transport = liverpc_http::HttpTransport::for_addr(addr);
//! let sum = transport.invoke("math.sum", vec![1.into(), 2.into()]).await?;
//! ```

pub mod handler;
pub mod server;
pub mod transport;

pub use handler::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use server::{router, start_server, AppState};
pub use transport::HttpTransport;
