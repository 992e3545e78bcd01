//! Shared IPC protocol types and framing.
//!
//! Defines the wire format for local IPC: 4-byte big-endian length prefix
//! followed by a UTF-8 JSON-RPC 2.0 payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Besides request/response pairs, the server pushes `publication`
//! notifications carrying `{subscription, event}` for open subscriptions.

use crate::config::{IpcConfig, RegistryConfig};
use crate::error::{ErrorKind, RemoteError, RpcError};
use crate::publication::PublicationEvent;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// JSON-RPC 2.0 request for IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

impl IpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response for IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    pub id: Option<Value>,
}

impl IpcResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, error: IpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// The outcome carried by this response. A response without `result`
    /// or `error` succeeded with `null`.
    pub fn into_result(self) -> std::result::Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error.into_remote()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object.
///
/// `data.kind` carries the caller-visible [`ErrorKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl IpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(-32700, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(-32600, message)
    }

    /// Classification of this error, from `data.kind` or else the code.
    pub fn kind(&self) -> ErrorKind {
        self.data
            .as_ref()
            .and_then(|data| data.get("kind"))
            .and_then(|kind| serde_json::from_value(kind.clone()).ok())
            .unwrap_or_else(|| ErrorKind::from_rpc_code(self.code))
    }

    pub fn into_remote(self) -> RemoteError {
        RemoteError::new(self.kind(), self.message)
    }
}

impl From<&RpcError> for IpcError {
    fn from(err: &RpcError) -> Self {
        Self {
            code: err.to_rpc_error_code(),
            message: err.to_string(),
            data: Some(json!({ "kind": err.kind() })),
        }
    }
}

/// JSON-RPC 2.0 notification sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

/// Params of a `publication` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicationParams {
    pub subscription: String,
    pub event: PublicationEvent,
}

impl IpcNotification {
    pub fn publication(subscription: &str, event: PublicationEvent) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: RegistryConfig::PUBLICATION_NOTIFICATION.to_string(),
            params: json!({ "subscription": subscription, "event": event }),
        }
    }
}

/// Params of a `__subscribe` request. The client picks the subscription id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Anything the server writes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Notification(IpcNotification),
    Response(IpcResponse),
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_IPC_MESSAGE_SIZE {
        return Err(RpcError::Transport {
            message: format!(
                "IPC message size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_IPC_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
