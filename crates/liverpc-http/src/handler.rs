//! JSON-RPC and server-sent event handlers.

use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream;
use liverpc::config::HttpConfig;
use liverpc::transport::params_to_args;
use liverpc::{ErrorKind, RemoteError, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure. `data.kind` carries the [`ErrorKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error.into_remote()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

impl JsonRpcError {
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

impl From<&RpcError> for JsonRpcError {
    fn from(err: &RpcError) -> Self {
        Self {
            code: err.to_rpc_error_code(),
            message: err.to_string(),
            data: Some(json!({ "kind": err.kind() })),
        }
    }
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// JSON-RPC endpoint. Array params are positional arguments; any other
/// params value is a single argument.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = request.method;
    let id = request.id;
    debug!("RPC call: {}", method);

    match state.dispatch.dispatch(&method, params_to_args(request.params)).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            warn!("RPC error for {}: {}", method, e);
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, JsonRpcError::from(&e))),
            )
        }
    }
}

/// Query string of the subscribe endpoint: `args` is a JSON array of
/// positional arguments.
#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    #[serde(default)]
    pub args: Option<String>,
}

/// Server-sent event stream of one subscription, one JSON
/// `PublicationEvent` per event. The subscription stops when the client goes
/// away.
pub async fn handle_subscribe(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    let params = match query.args.as_deref().map(serde_json::from_str::<Value>).transpose() {
        Ok(params) => params,
        Err(e) => {
            return error_response(&RpcError::Validation {
                message: format!("Invalid subscription args: {}", e),
            })
        }
    };

    let subscription = match state.dispatch.open(&name, params_to_args(params)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Subscription to {} failed: {}", name, e);
            return error_response(&e);
        }
    };
    info!("Streaming subscription to {}", name);

    let mirror = subscription.mirror_name().to_string();
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next_event().await?;
        Some((Event::default().json_data(&event), subscription))
    });

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&mirror) {
        response.headers_mut().insert(HttpConfig::MIRROR_HEADER, value);
    }
    response
}

fn error_response(err: &RpcError) -> Response {
    let status = match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(JsonRpcError::from(err))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_keeps_kind() {
        let err = RpcError::NotImplemented {
            name: "todos.add".into(),
        };
        let wire = JsonRpcError::from(&err);
        assert_eq!(wire.code, err.to_rpc_error_code());

        let remote = JsonRpcResponse::error(Some(json!(1)), wire)
            .into_result()
            .unwrap_err();
        assert_eq!(remote.kind, ErrorKind::NotImplemented);
    }

    #[test]
    fn test_kind_falls_back_to_code() {
        let wire = JsonRpcError {
            code: ErrorKind::NotFound.rpc_code(),
            message: "gone".into(),
            data: None,
        };
        assert_eq!(wire.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_missing_result_is_null() {
        let response: JsonRpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1})).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }
}
