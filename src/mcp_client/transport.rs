//! JSON-RPC over a persistent byte stream.
//!
//! Handles low-level communication with a tool server:
//! - Writing line-delimited JSON-RPC requests and notifications
//! - A background read loop that demultiplexes responses by request id
//! - Per-call timeouts, and rejection of every pending call when the stream ends
//!
//! The transport is generic over `AsyncRead`/`AsyncWrite` so it runs the same
//! way over child-process stdio and over in-memory pipes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, InboundMessage, JsonRpcRequest, MessageKind};

/// Server notifications buffered for the handshake; extras are dropped.
const NOTIFICATION_BUFFER: usize = 64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<TokioMutex<BoxedWriter>>;
type PendingMap = Arc<Mutex<HashMap<u64, PendingRequest>>>;

// ─── Pending Requests ────────────────────────────────────────────────────────

/// An outbound call waiting for its response.
struct PendingRequest {
    method: String,
    issued_at: Instant,
    waiter: oneshot::Sender<Result<Value, McpError>>,
}

fn lock_pending(pending: &Mutex<HashMap<u64, PendingRequest>>) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// First request id for a new transport.
///
/// Seeded from the wall clock so ids stay distinct across respawns of the
/// same server; strictly increasing afterwards.
fn initial_request_id() -> u64 {
    chrono::Utc::now().timestamp_millis().max(1) as u64
}

/// A notification received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub method: String,
    pub params: Option<Value>,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport to one tool server.
pub struct Transport {
    server_name: String,
    next_id: AtomicU64,
    writer: SharedWriter,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    notifications: TokioMutex<mpsc::Receiver<ServerNotification>>,
    read_task: JoinHandle<()>,
}

impl Transport {
    /// Create a transport and start its read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(server_name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let writer: SharedWriter = Arc::new(TokioMutex::new(Box::new(writer)));
        let closed = Arc::new(AtomicBool::new(false));
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);

        let read_task = tokio::spawn(read_loop(ReadLoop {
            server: server_name.to_string(),
            reader: BufReader::new(reader),
            pending: Arc::clone(&pending),
            writer: Arc::clone(&writer),
            notifications: notify_tx,
            closed: Arc::clone(&closed),
        }));

        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(initial_request_id()),
            writer,
            pending,
            closed,
            notifications: TokioMutex::new(notify_rx),
            read_task,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether the read loop has seen the end of the stream.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Send a request and wait for the response with the matching id.
    ///
    /// Resolves with the `result` payload, a `ServerError` for a JSON-RPC
    /// error response, `Timeout` once `timeout` elapses, or `TransportClosed`
    /// if the stream ends first. A timeout removes the pending entry; a late
    /// response is then dropped by the read loop.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = lock_pending(&self.pending);
            // Checked under the same lock the read loop drains with, so a
            // waiter can never be registered after the drain.
            if self.is_closed() {
                return Err(self.closed_error());
            }
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    waiter: tx,
                },
            );
        }

        let request = JsonRpcRequest::new(id, method, params);
        let exchange = async {
            if let Err(e) = write_line(&self.writer, &self.server_name, &request).await {
                return Err(e);
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(self.closed_error()),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.remove_pending(id);
                Err(e)
            }
            Err(_) => {
                if let Some(entry) = self.remove_pending(id) {
                    tracing::warn!(
                        server = %self.server_name,
                        method = %entry.method,
                        id,
                        elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                        "request timed out"
                    );
                }
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let notification = JsonRpcRequest::notification(method, params);
        write_line(&self.writer, &self.server_name, &notification).await
    }

    /// Wait until the server sends a notification with the given method.
    ///
    /// Other notifications received meanwhile are discarded.
    pub async fn wait_for_notification(
        &self,
        method: &str,
        timeout: Duration,
    ) -> Result<ServerNotification, McpError> {
        let mut notifications = self.notifications.lock().await;
        let wait = async {
            while let Some(note) = notifications.recv().await {
                if note.method == method {
                    return Ok(note);
                }
                tracing::debug!(
                    server = %self.server_name,
                    method = %note.method,
                    "ignoring notification while waiting for readiness"
                );
            }
            Err(self.closed_error())
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Close the write half. Well-behaved servers exit on stdin EOF.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(server = %self.server_name, error = %e, "closing transport writer failed");
        }
    }

    fn remove_pending(&self, id: u64) -> Option<PendingRequest> {
        lock_pending(&self.pending).remove(&id)
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server_name.clone(),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

// ─── Writing ─────────────────────────────────────────────────────────────────

/// Serialize one message and write it as a single line.
async fn write_line<T: Serialize>(
    writer: &TokioMutex<BoxedWriter>,
    server: &str,
    message: &T,
) -> Result<(), McpError> {
    let mut line = serde_json::to_string(message).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    line.push('\n');

    let mut writer = writer.lock().await;
    let written = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    };
    written.await.map_err(|e| match e.kind() {
        std::io::ErrorKind::BrokenPipe => McpError::TransportClosed {
            server: server.to_string(),
        },
        _ => McpError::TransportError {
            server: server.to_string(),
            reason: format!("failed to write: {e}"),
        },
    })
}

// ─── Read Loop ───────────────────────────────────────────────────────────────

struct ReadLoop<R> {
    server: String,
    reader: BufReader<R>,
    pending: PendingMap,
    writer: SharedWriter,
    notifications: mpsc::Sender<ServerNotification>,
    closed: Arc<AtomicBool>,
}

/// Read frames until EOF, then reject every outstanding waiter.
async fn read_loop<R: AsyncRead + Unpin>(mut state: ReadLoop<R>) {
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match state.reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!(server = %state.server, "server stream reached EOF");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %state.server, error = %e, "read from server failed");
                break;
            }
        }

        let frame = trim_ascii(&buf);
        if frame.is_empty() {
            continue;
        }

        match serde_json::from_slice::<InboundMessage>(frame) {
            Ok(message) => state.dispatch(message),
            Err(e) => {
                tracing::warn!(
                    server = %state.server,
                    error = %e,
                    frame = %String::from_utf8_lossy(frame),
                    "skipping malformed frame"
                );
            }
        }
    }

    let drained: Vec<PendingRequest> = {
        let mut pending = lock_pending(&state.pending);
        state.closed.store(true, Ordering::Release);
        pending.drain().map(|(_, entry)| entry).collect()
    };
    if !drained.is_empty() {
        tracing::warn!(
            server = %state.server,
            count = drained.len(),
            "transport closed with calls in flight"
        );
    }
    for entry in drained {
        let _ = entry.waiter.send(Err(McpError::TransportClosed {
            server: state.server.clone(),
        }));
    }
}

impl<R> ReadLoop<R> {
    fn dispatch(&self, message: InboundMessage) {
        match message.kind() {
            MessageKind::Response { id } => self.resolve(id, message),
            MessageKind::Notification { method } => {
                let note = ServerNotification {
                    method,
                    params: message.params,
                };
                if self.notifications.try_send(note).is_err() {
                    tracing::trace!(server = %self.server, "notification buffer full, dropping");
                }
            }
            MessageKind::ServerRequest { id, method } => self.answer_server_request(id, &method),
            MessageKind::Invalid => {
                tracing::warn!(server = %self.server, "skipping frame that is not JSON-RPC");
            }
        }
    }

    fn resolve(&self, id: u64, message: InboundMessage) {
        let Some(entry) = lock_pending(&self.pending).remove(&id) else {
            tracing::warn!(server = %self.server, id, "dropping response with unmatched id");
            return;
        };

        tracing::debug!(
            server = %self.server,
            method = %entry.method,
            id,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "response received"
        );

        let outcome = match message.error {
            Some(err) => Err(McpError::ServerError {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            None => Ok(message.result.unwrap_or(Value::Null)),
        };
        // The caller may already have timed out and gone away.
        let _ = entry.waiter.send(outcome);
    }

    /// Reply to a server-initiated request without blocking the read loop.
    fn answer_server_request(&self, id: Value, method: &str) {
        let reply = if method == "ping" {
            json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            tracing::debug!(server = %self.server, method, "rejecting server-initiated request");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": error_codes::METHOD_NOT_FOUND,
                    "message": format!("method '{method}' is not supported by this client"),
                },
            })
        };

        let writer = Arc::clone(&self.writer);
        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = write_line(&writer, &server, &reply).await {
                tracing::debug!(server = %server, error = %e, "failed to answer server request");
            }
        });
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Transport wired to an in-memory peer; returns the peer's line reader and writer.
    fn connect() -> (
        Transport,
        tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let transport = Transport::new("test", client_read, client_write);
        (transport, BufReader::new(server_read).lines(), server_write)
    }

    async fn send(writer: &mut tokio::io::WriteHalf<DuplexStream>, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_resolves_matching_response() {
        let (transport, mut peer_lines, mut peer_writer) = connect();

        let peer = tokio::spawn(async move {
            let line = peer_lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["method"], "tools/list");
            send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": req["id"], "result": {"tools": []}})).await;
            (peer_lines, peer_writer)
        });

        let result = transport
            .call("tools/list", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, json!({"tools": []}));
        assert_eq!(transport.pending_count(), 0);
        let _keep_open = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_demultiplexed() {
        let (transport, mut peer_lines, mut peer_writer) = connect();
        let transport = Arc::new(transport);

        let peer = tokio::spawn(async move {
            let first: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
            let second: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
            // Answer in reverse order.
            send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": second["id"], "result": second["method"]})).await;
            send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": first["id"], "result": first["method"]})).await;
            (peer_lines, peer_writer)
        });

        let a = Arc::clone(&transport);
        let b = Arc::clone(&transport);
        let first = tokio::spawn(async move { a.call("alpha", None, Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn(async move { b.call("beta", None, Duration::from_secs(2)).await });

        assert_eq!(first.await.unwrap().unwrap(), json!("alpha"));
        assert_eq!(second.await.unwrap().unwrap(), json!("beta"));
        let _keep_open = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let (transport, mut peer_lines, _peer_writer) = connect();

        for _ in 0..3 {
            let _ = transport.call("noop", None, Duration::from_millis(10)).await;
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            let line = peer_lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            ids.push(req["id"].as_u64().unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (transport, _peer_lines, _peer_writer) = connect();

        let err = transport
            .call("tools/call", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(transport.pending_count(), 0);
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let (transport, mut peer_lines, mut peer_writer) = connect();

        let err = transport
            .call("slow", None, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let late: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
        send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": late["id"], "result": "late"})).await;

        let peer = tokio::spawn(async move {
            let req: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
            send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": req["id"], "result": "fresh"})).await;
            (peer_lines, peer_writer)
        });

        let value = transport.call("fast", None, Duration::from_secs(2)).await.unwrap();
        assert_eq!(value, json!("fresh"));
        let _keep_open = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_close_rejects_pending_calls() {
        let (transport, mut peer_lines, peer_writer) = connect();

        let peer = tokio::spawn(async move {
            let _ = peer_lines.next_line().await;
            drop(peer_lines);
            drop(peer_writer);
        });

        let err = transport
            .call("initialize", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transport_closed(), "got {err:?}");
        peer.await.unwrap();

        assert!(transport.is_closed());
        let again = transport.call("tools/list", None, Duration::from_secs(1)).await.unwrap_err();
        assert!(again.is_transport_closed());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let (transport, mut peer_lines, mut peer_writer) = connect();

        let peer = tokio::spawn(async move {
            let req: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
            peer_writer.write_all(b"server log line, not json\n").await.unwrap();
            peer_writer.write_all(b"{\"unrelated\": true}\n\n").await.unwrap();
            send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": req["id"], "result": 42})).await;
            (peer_lines, peer_writer)
        });

        let value = transport.call("count", None, Duration::from_secs(2)).await.unwrap();
        assert_eq!(value, json!(42));
        let _keep_open = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_maps_to_server_error() {
        let (transport, mut peer_lines, mut peer_writer) = connect();

        let peer = tokio::spawn(async move {
            let req: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
            send(
                &mut peer_writer,
                json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32602, "message": "bad params"}}),
            )
            .await;
            (peer_lines, peer_writer)
        });

        let err = transport.call("tools/call", None, Duration::from_secs(2)).await.unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, error_codes::INVALID_PARAMS);
                assert_eq!(message, "bad params");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
        let _keep_open = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_notification() {
        let (transport, _peer_lines, mut peer_writer) = connect();

        send(&mut peer_writer, json!({"jsonrpc": "2.0", "method": "notifications/progress"})).await;
        send(&mut peer_writer, json!({"jsonrpc": "2.0", "method": "notifications/ready", "params": {"indexed": 10}})).await;

        let note = transport
            .wait_for_notification("notifications/ready", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(note.params, Some(json!({"indexed": 10})));

        let err = transport
            .wait_for_notification("notifications/ready", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (_transport, mut peer_lines, mut peer_writer) = connect();

        send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": "p1", "method": "ping"})).await;
        let reply: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], "p1");
        assert_eq!(reply["result"], json!({}));

        send(&mut peer_writer, json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage"})).await;
        let reply: Value = serde_json::from_str(&peer_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_trim_ascii() {
        assert_eq!(trim_ascii(b"  {}\r\n"), b"{}");
        assert_eq!(trim_ascii(b"\n"), b"");
    }
}
