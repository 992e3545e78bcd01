//! TCP IPC server exposing a dispatcher.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port), accepts connections and
//! dispatches JSON-RPC method calls to a [`Dispatch`] implementation, usually
//! a [`Registry`](crate::Registry).
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task; requests on one connection are processed concurrently and
//! answered through a single writer task. Subscriptions opened on a
//! connection are forwarded by one task each and are stopped when the
//! connection closes.

use super::protocol::{
    read_frame, write_frame, IpcError, IpcNotification, IpcRequest, IpcResponse, ServerMessage,
    SubscribeParams,
};
use crate::config::{IpcConfig, RegistryConfig};
use crate::error::RpcError;
use crate::locks;
use crate::transport::{params_to_args, Dispatch};
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

type Outbox = mpsc::UnboundedSender<ServerMessage>;
type Forwarders = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// IPC server that listens for client connections.
pub struct IpcServer;

impl IpcServer {
    /// Start the IPC server on a random local port.
    ///
    /// Returns a handle that can be used to get the port and shut down the server.
    /// The server runs in background tokio tasks.
    pub async fn start<D: Dispatch>(dispatch: Arc<D>) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("IPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: Dispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_IPC_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_IPC_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, dispatch, &mut conn_shutdown).await {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: Dispatch>(
        stream: TcpStream,
        dispatch: Arc<D>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(Self::write_loop(writer, outbox_rx));
        let forwarders: Forwarders = Arc::new(Mutex::new(HashMap::new()));

        let result = loop {
            // Wait for either a frame or a shutdown signal
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(f)) => f,
                        Ok(None) => break Ok(()), // Clean disconnect
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(()); // Server shutting down
                }
            };

            let dispatch = dispatch.clone();
            let outbox = outbox.clone();
            let forwarders = forwarders.clone();
            tokio::spawn(async move {
                if let Some(response) = Self::process_frame(frame, &dispatch, &outbox, &forwarders).await {
                    let _ = outbox.send(ServerMessage::Response(response));
                }
            });
        };

        let open: Vec<(String, JoinHandle<()>)> = locks::lock(&forwarders).drain().collect();
        for (id, task) in open {
            debug!("Stopping subscription {} of closed connection", id);
            task.abort();
        }
        writer_task.abort();
        result
    }

    async fn write_loop(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<ServerMessage>) {
        while let Some(message) = outbox.recv().await {
            let bytes = match serde_json::to_vec(&message) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Failed to encode IPC message: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                debug!("IPC write failed: {}", e);
                break;
            }
        }
    }

    /// Returns the response to send, if the frame was a request with an id.
    async fn process_frame<D: Dispatch>(
        frame: Vec<u8>,
        dispatch: &Arc<D>,
        outbox: &Outbox,
        forwarders: &Forwarders,
    ) -> Option<IpcResponse> {
        let request: IpcRequest = match serde_json::from_slice(&frame) {
            Ok(req) => req,
            Err(e) => {
                return Some(IpcResponse::error(
                    None,
                    IpcError::parse_error(format!("Parse error: {}", e)),
                ));
            }
        };

        // Validate JSON-RPC version
        if request.jsonrpc != "2.0" {
            return Some(IpcResponse::error(
                request.id,
                IpcError::invalid_request("Invalid Request: expected jsonrpc 2.0"),
            ));
        }

        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            RegistryConfig::SUBSCRIBE_METHOD => {
                Self::subscribe(request.params, dispatch, outbox, forwarders).await
            }
            RegistryConfig::UNSUBSCRIBE_METHOD => Self::unsubscribe(request.params, forwarders),
            method => {
                dispatch
                    .dispatch(method, params_to_args(request.params))
                    .await
            }
        };

        let id = id?;
        Some(match outcome {
            Ok(result) => IpcResponse::success(Some(id), result),
            Err(e) => IpcResponse::error(Some(id), IpcError::from(&e)),
        })
    }

    async fn subscribe<D: Dispatch>(
        params: Option<Value>,
        dispatch: &Arc<D>,
        outbox: &Outbox,
        forwarders: &Forwarders,
    ) -> std::result::Result<Value, RpcError> {
        let params: SubscribeParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| RpcError::Validation {
                message: format!("Invalid subscribe params: {}", e),
            })?;

        let mut subscription = dispatch.open(&params.name, params.args).await?;
        let mirror = subscription.mirror_name().to_string();

        let sub_id = params.id.clone();
        let outbox = outbox.clone();
        let registry = forwarders.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next_event().await {
                let note = IpcNotification::publication(&sub_id, event);
                if outbox.send(ServerMessage::Notification(note)).is_err() {
                    break;
                }
            }
            locks::lock(&registry).remove(&sub_id);
        });

        if let Some(previous) = locks::lock(forwarders).insert(params.id.clone(), task) {
            warn!("Subscription id {} reused, stopping the previous one", params.id);
            previous.abort();
        }
        debug!("Subscription {} to {} opened", params.id, params.name);

        Ok(json!({ "subscription": params.id, "mirror": mirror }))
    }

    fn unsubscribe(params: Option<Value>, forwarders: &Forwarders) -> std::result::Result<Value, RpcError> {
        let id = params_to_args(params)
            .into_iter()
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| RpcError::Validation {
                message: "Expected a subscription id".to_string(),
            })?;

        let task = locks::lock(forwarders).remove(&id);
        match task {
            Some(task) => {
                task.abort();
                debug!("Subscription {} stopped", id);
                Ok(Value::Bool(true))
            }
            None => Ok(Value::Bool(false)),
        }
    }
}
