//! JSON-RPC over Server-Sent Events.
//!
//! The client opens a GET event stream. The server's first `endpoint` event
//! names the URL that requests are POSTed to; responses come back as
//! `message` events on the stream and are routed to waiters by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{extract_result, next_request_id, Transport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::sse::SseDecoder;
use crate::sync::lock;

/// How long to wait for the `endpoint` event after the stream opens.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct SseTransport {
    server_name: String,
    http: reqwest::Client,
    endpoint: reqwest::Url,
    waiters: Waiters,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its
    /// message endpoint.
    pub async fn connect(server_name: &str, url: &str) -> Result<Self, McpError> {
        let base = reqwest::Url::parse(url).map_err(|e| McpError::ConfigError {
            reason: format!("invalid url for server '{server_name}': {e}"),
        })?;
        let http = reqwest::Client::new();

        let response = http
            .get(base.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::SpawnFailed {
                name: server_name.to_string(),
                reason: format!("cannot open event stream: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(McpError::SpawnFailed {
                name: server_name.to_string(),
                reason: format!("event stream returned HTTP {}", response.status()),
            });
        }

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = tokio::spawn(read_events(
            server_name.to_string(),
            response.bytes_stream(),
            endpoint_tx,
            Arc::clone(&waiters),
            Arc::clone(&closed),
        ));

        let endpoint = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(path)) => base.join(path.trim()).map_err(|e| McpError::InitFailed {
                name: server_name.to_string(),
                reason: format!("invalid endpoint '{path}': {e}"),
            }),
            Ok(Err(_)) => Err(McpError::InitFailed {
                name: server_name.to_string(),
                reason: "event stream closed before the endpoint event".into(),
            }),
            Err(_) => Err(McpError::InitFailed {
                name: server_name.to_string(),
                reason: format!(
                    "no endpoint event within {}s",
                    ENDPOINT_TIMEOUT.as_secs()
                ),
            }),
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };

        tracing::debug!(server = %server_name, endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            endpoint,
            waiters,
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    async fn post(&self, body: String) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST failed: {e}")))?;
        if !response.status().is_success() {
            return Err(self.transport_error(format!("POST returned HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if self.is_closed() {
            return Err(self.transport_error("event stream closed".into()));
        }

        let id = next_request_id();
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(id, tx);
        let guard = WaiterGuard {
            id,
            waiters: &self.waiters,
        };

        self.post(body).await?;

        let response = rx
            .await
            .map_err(|_| self.transport_error("event stream closed while waiting".into()))?;
        drop(guard);
        extract_result(response)
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.transport_error("event stream closed".into()));
        }
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        self.post(body).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        lock(&self.waiters).clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Removes a waiter on every exit path of `request`.
struct WaiterGuard<'a> {
    id: u64,
    waiters: &'a Waiters,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.waiters).remove(&self.id);
    }
}

async fn read_events<S, B, E>(
    server_name: String,
    bytes: S,
    endpoint_tx: oneshot::Sender<String>,
    waiters: Waiters,
    closed: Arc<AtomicBool>,
) where
    S: futures::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut bytes = Box::pin(bytes);
    let mut decoder = SseDecoder::new();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "SSE stream error");
                break;
            }
        };
        decoder.push(chunk.as_ref());

        while let Some(event) = decoder.next_event() {
            match event.name() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                }
                "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(resp) => {
                        let waiter = resp.id.and_then(|id| lock(&waiters).remove(&id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => {
                                tracing::debug!(server = %server_name, id = ?resp.id, "unrouted SSE message");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(server = %server_name, error = %e, "unparseable SSE message");
                    }
                },
                other => {
                    tracing::trace!(server = %server_name, event = %other, "ignored SSE event");
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiter immediately.
    lock(&waiters).clear();
    tracing::info!(server = %server_name, "SSE stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_routes_responses_and_fails_waiters_on_end() {
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        lock(&waiters).insert(1, tx1);
        lock(&waiters).insert(2, tx2);

        let body = concat!(
            "event: endpoint\ndata: /messages?session=abc\n\n",
            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n",
        );
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(body.as_bytes().to_vec())]);

        read_events("test".into(), stream, endpoint_tx, waiters.clone(), closed.clone()).await;

        assert_eq!(endpoint_rx.await.unwrap(), "/messages?session=abc");
        let resp = rx1.await.unwrap();
        assert_eq!(extract_result(resp).unwrap()["ok"], true);
        assert!(rx2.await.is_err());
        assert!(closed.load(Ordering::SeqCst));
        assert!(lock(&waiters).is_empty());
    }
}
