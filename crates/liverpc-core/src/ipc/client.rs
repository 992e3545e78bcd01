//! TCP IPC client.
//!
//! Establishes a TCP connection to an [`IpcServer`](super::IpcServer) and
//! implements [`Transport`] over it.
//!
//! # Thread Safety
//!
//! Frames are written by one writer task and read by one reader task. The
//! reader routes each response to the caller waiting on its id and each
//! `publication` notification to its subscription, so any number of calls
//! and subscriptions can be in flight concurrently.

use super::protocol::{
    read_frame, write_frame, IpcRequest, IpcResponse, PublicationParams, ServerMessage,
    SubscribeParams,
};
use crate::config::{IpcConfig, RegistryConfig};
use crate::error::{RemoteError, RpcError};
use crate::locks;
use crate::publication::{PublicationEvent, StopHandle, Subscription};
use crate::transport::{RemoteSubscription, Transport};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Shared {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<IpcResponse>>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<PublicationEvent>>>,
}

impl Shared {
    fn send(&self, method: &str, params: Value) -> std::result::Result<u64, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = IpcRequest::new(method, params, id);
        let bytes = serde_json::to_vec(&request)?;
        self.outbox
            .send(bytes)
            .map_err(|_| RemoteError::transport("IPC connection closed"))?;
        Ok(id)
    }
}

/// IPC client connected to a server.
pub struct IpcClient {
    addr: SocketAddr,
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcClient").field("addr", &self.addr).finish()
    }
}

impl IpcClient {
    /// Connect to an IPC server.
    ///
    /// Uses the configured connection timeout from `IpcConfig`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(IpcConfig::IPC_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Transport {
                message: format!("Timed out connecting to {}", addr),
            })?
            .map_err(|e| RpcError::Transport {
                message: format!("Failed to connect to {}: {}", addr, e),
            })?;

        debug!("IPC client connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbox,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        });

        let writer_task = tokio::spawn(write_loop(writer, outbox_rx));
        let reader_task = tokio::spawn(read_loop(reader, shared.clone()));

        Ok(Self {
            addr,
            shared,
            reader_task,
            writer_task,
        })
    }

    /// Get the address of the connected server.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Call a JSON-RPC method on the server.
    ///
    /// If the connection is broken, returns a `Transport` error.
    pub async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, RemoteError> {
        let (tx, rx) = oneshot::channel();
        // Register before sending so a fast response cannot be missed.
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        locks::lock(&self.shared.pending).insert(id, tx);
        if self.shared.closed.load(Ordering::SeqCst) {
            locks::lock(&self.shared.pending).remove(&id);
            return Err(RemoteError::transport("IPC connection closed"));
        }

        let request = IpcRequest::new(method, params, id);
        let sent = serde_json::to_vec(&request)
            .map_err(RemoteError::from)
            .and_then(|bytes| {
                self.shared
                    .outbox
                    .send(bytes)
                    .map_err(|_| RemoteError::transport("IPC connection closed"))
            });
        if let Err(e) = sent {
            locks::lock(&self.shared.pending).remove(&id);
            return Err(e);
        }

        let response = rx
            .await
            .map_err(|_| RemoteError::transport("IPC connection closed"))?;
        response.into_result()
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[async_trait]
impl Transport for IpcClient {
    async fn invoke(&self, name: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteError> {
        self.call(name, Value::Array(args)).await
    }

    async fn subscribe(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> std::result::Result<RemoteSubscription, RemoteError> {
        let sub_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        locks::lock(&self.shared.subscriptions).insert(sub_id.clone(), tx);

        let params = serde_json::to_value(SubscribeParams {
            id: sub_id.clone(),
            name: name.to_string(),
            args,
        })?;
        let result = match self.call(RegistryConfig::SUBSCRIBE_METHOD, params).await {
            Ok(result) => result,
            Err(e) => {
                locks::lock(&self.shared.subscriptions).remove(&sub_id);
                return Err(e);
            }
        };
        let mirror = result
            .get("mirror")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();

        let shared = Arc::downgrade(&self.shared);
        let stop = StopHandle::new(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            locks::lock(&shared.subscriptions).remove(&sub_id);
            if let Err(e) = shared.send(RegistryConfig::UNSUBSCRIBE_METHOD, json!([sub_id])) {
                debug!("Could not send unsubscribe for {}: {}", sub_id, e);
            }
        });

        Ok(Subscription::new(name, mirror, rx, stop))
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = outbox.recv().await {
        if let Err(e) = write_frame(&mut writer, &bytes).await {
            debug!("IPC write failed: {}", e);
            break;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("IPC read failed: {}", e);
                break;
            }
        };

        match serde_json::from_slice::<ServerMessage>(&frame) {
            Ok(ServerMessage::Response(response)) => {
                let waiter = response
                    .id
                    .as_ref()
                    .and_then(Value::as_u64)
                    .and_then(|id| locks::lock(&shared.pending).remove(&id));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(response);
                }
            }
            Ok(ServerMessage::Notification(note)) => {
                if note.method != RegistryConfig::PUBLICATION_NOTIFICATION {
                    continue;
                }
                let params: PublicationParams = match serde_json::from_value(note.params) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("Malformed publication notification: {}", e);
                        continue;
                    }
                };
                let mut subscriptions = locks::lock(&shared.subscriptions);
                let terminal = params.event.is_terminal();
                if let Some(tx) = subscriptions.get(&params.subscription) {
                    let _ = tx.send(params.event);
                }
                if terminal {
                    subscriptions.remove(&params.subscription);
                }
            }
            Err(e) => warn!("Malformed IPC message: {}", e),
        }
    }

    debug!("IPC connection closed");
    shared.closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails pending calls and ends open subscriptions.
    locks::lock(&shared.pending).clear();
    locks::lock(&shared.subscriptions).clear();
}
