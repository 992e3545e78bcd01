//! Local IPC transport.
//!
//! Provides a lightweight TCP-based transport between a process owning a
//! [`Registry`](crate::Registry) and its clients. Uses length-prefixed
//! JSON-RPC 2.0 over `127.0.0.1` TCP connections.
//!
//! # Architecture
//!
//! - **Server**: accepts connections, dispatches method calls and forwards
//!   subscription events as notifications
//! - **Client**: implements [`Transport`](crate::Transport) over one connection
//! - **Protocol**: Shared framing and JSON-RPC types used by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{IpcRequest, IpcResponse};
pub use server::{IpcServer, IpcServerHandle};
