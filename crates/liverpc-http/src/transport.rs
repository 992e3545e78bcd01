//! HTTP client transport.
//!
//! Calls go to `POST /rpc`; subscriptions read the server-sent event stream
//! of `GET /subscribe/{name}` on a background task.

use crate::handler::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use liverpc::config::HttpConfig;
use liverpc::transport::RemoteSubscription;
use liverpc::{PublicationEvent, RemoteError, StopHandle, Subscription, Transport};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// [`Transport`] over the HTTP adapter.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    next_id: AtomicU64,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpTransport {
    /// Transport for a server at `base_url`, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn for_addr(addr: SocketAddr) -> Self {
        Self::new(format!("http://{}", addr))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::transport(format!("HTTP request failed: {}", err))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(name, Value::Array(args), id);

        let response = self
            .client
            .post(format!("{}/rpc", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::transport(format!(
                "HTTP {} calling {}",
                status, name
            )));
        }

        let body: JsonRpcResponse = response.json().await.map_err(transport_error)?;
        body.into_result()
    }

    async fn subscribe(&self, name: &str, args: Vec<Value>) -> Result<RemoteSubscription, RemoteError> {
        let args = serde_json::to_string(&args)?;
        let response = self
            .client
            .get(format!("{}/subscribe/{}", self.base_url, name))
            .query(&[("args", args)])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(match response.json::<JsonRpcError>().await {
                Ok(error) => error.into_remote(),
                Err(_) => RemoteError::transport(format!("HTTP {} subscribing to {}", status, name)),
            });
        }

        let mirror = response
            .headers()
            .get(HttpConfig::MIRROR_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(name)
            .to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(read_events(response, tx, name.to_string()));
        let stop = StopHandle::new(move || task.abort());
        Ok(Subscription::new(name, mirror, rx, stop))
    }
}

async fn read_events(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<PublicationEvent>,
    name: String,
) {
    let mut body = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Event stream of {} failed: {}", name, e);
                break;
            }
        };
        for data in parser.push(&chunk) {
            match serde_json::from_str::<PublicationEvent>(&data) {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if tx.send(event).is_err() || terminal {
                        return;
                    }
                }
                Err(e) => warn!("Malformed event on {}: {}", name, e),
            }
        }
    }

    let _ = tx.send(PublicationEvent::Error {
        error: RemoteError::transport(format!("Event stream of {} closed", name)),
    });
}

/// Incremental `text/event-stream` parser yielding the data of each event.
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block[..end]);

            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|data| data.strip_prefix(' ').unwrap_or(data))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}
