//! In-memory doubles shared by the unit tests.
//!
//! [`FakeLauncher`] starts scripted tool servers over `tokio::io::duplex`
//! pipes, [`ScriptedBackend`] answers model calls by purpose, and
//! [`CollectingSink`] records what the engine streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use crate::agent_core::errors::SinkError;
use crate::agent_core::sink::{Sink, SinkEvent};
use crate::inference::{CallPurpose, GenerateRequest, InferenceError, ModelBackend};
use crate::mcp_client::lifecycle::{LaunchedProcess, ProcessHandle};
use crate::mcp_client::{Launcher, McpError, ServerConfig};

const PIPE_CAPACITY: usize = 64 * 1024;

/// A `ServerConfig` with nothing but a command.
pub fn server_config() -> ServerConfig {
    ServerConfig {
        command: "fake-server".into(),
        args: Vec::new(),
        env: HashMap::new(),
        cwd: None,
        ready_notification: None,
        default_safety: None,
        default_tier: None,
        tools: HashMap::new(),
    }
}

// ─── Fake Tool Server ───────────────────────────────────────────────────────

/// Behavior script for one fake tool server.
///
/// Tool names drive the call behavior: `crash` kills the server, `fail`
/// returns an `isError` result, `slow` adds `slow_delay`, anything else
/// echoes its arguments.
#[derive(Debug, Clone)]
pub struct FakeServer {
    pub tools: Vec<Value>,
    pub die_on_initialize: bool,
    pub ready_notification: Option<String>,
    pub ready_delay: Duration,
    pub page_size: Option<usize>,
    pub call_delay: Duration,
    pub slow_delay: Duration,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            die_on_initialize: false,
            ready_notification: None,
            ready_delay: Duration::ZERO,
            page_size: None,
            call_delay: Duration::ZERO,
            slow_delay: Duration::from_millis(300),
        }
    }
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        let tools = names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("Fake {name} tool. Used in tests."),
                    "inputSchema": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}}
                    }
                })
            })
            .collect();
        Self {
            tools,
            ..Self::default()
        }
    }
}

/// Counters shared by every server a launcher starts.
#[derive(Debug, Default)]
pub struct FakeStats {
    methods: Mutex<Vec<String>>,
    tool_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeStats {
    /// Every method received, in arrival order.
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn tool_calls(&self) -> usize {
        self.tool_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `tools/call` requests being worked on at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, method: &str) {
        self.methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(method.to_string());
        if method == "tools/call" {
            self.tool_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<DuplexStream>>;

async fn send(writer: &SharedWriter, message: Value) {
    let mut line = message.to_string();
    line.push('\n');
    let mut writer = writer.lock().await;
    // The client may already be gone; that is its problem.
    let _ = writer.write_all(line.as_bytes()).await;
    let _ = writer.flush().await;
}

async fn reply(writer: &SharedWriter, id: Value, result: Value) {
    send(writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
}

async fn serve(
    script: FakeServer,
    reader: DuplexStream,
    writer: DuplexStream,
    stats: Arc<FakeStats>,
    alive: Arc<AtomicBool>,
) {
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        stats.record(method);
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => {
                if script.die_on_initialize {
                    break;
                }
                let result = json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-server", "version": "0.0.1"}
                });
                reply(&writer, id, result).await;
            }
            "notifications/initialized" => {
                if let Some(notification) = script.ready_notification.clone() {
                    let writer = Arc::clone(&writer);
                    let delay = script.ready_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        send(&writer, json!({"jsonrpc": "2.0", "method": notification})).await;
                    });
                }
            }
            "tools/list" => {
                let start = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(script.tools.len());
                let end = script
                    .page_size
                    .map_or(script.tools.len(), |size| (start + size).min(script.tools.len()));
                let mut result = json!({"tools": &script.tools[start..end]});
                if end < script.tools.len() {
                    result["nextCursor"] = json!(end.to_string());
                }
                reply(&writer, id, result).await;
            }
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                if name == "crash" {
                    break;
                }
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let writer = Arc::clone(&writer);
                let stats = Arc::clone(&stats);
                let script = script.clone();
                tokio::spawn(async move {
                    stats.enter();
                    tokio::time::sleep(script.call_delay).await;
                    if name == "slow" {
                        tokio::time::sleep(script.slow_delay).await;
                    }
                    let result = if name == "fail" {
                        json!({"content": [{"type": "text", "text": "boom"}], "isError": true})
                    } else {
                        json!({"content": [{"type": "text", "text": arguments.to_string()}]})
                    };
                    stats.exit();
                    reply(&writer, id, result).await;
                });
            }
            _ => {
                if !id.is_null() {
                    let error = json!({"code": -32601, "message": format!("method not found: {method}")});
                    send(&writer, json!({"jsonrpc": "2.0", "id": id, "error": error})).await;
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    let _ = writer.lock().await.shutdown().await;
}

struct FakeHandle {
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self, grace: Duration) {
        let alive = Arc::clone(&self.alive);
        let exited = tokio::time::timeout(grace, async move {
            while alive.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if exited.is_err() {
            self.task.abort();
            self.alive.store(false, Ordering::SeqCst);
        }
    }
}

/// Launches [`FakeServer`]s in-process.
///
/// Per name, queued scripts are used first (once each), then the named
/// script, then the default.
pub struct FakeLauncher {
    default: FakeServer,
    named: HashMap<String, FakeServer>,
    queued: Mutex<HashMap<String, VecDeque<FakeServer>>>,
    launches: AtomicUsize,
    stats: Arc<FakeStats>,
}

impl FakeLauncher {
    pub fn new(default: FakeServer) -> Self {
        Self {
            default,
            named: HashMap::new(),
            queued: Mutex::new(HashMap::new()),
            launches: AtomicUsize::new(0),
            stats: Arc::new(FakeStats::default()),
        }
    }

    pub fn with_server(mut self, name: &str, script: FakeServer) -> Self {
        self.named.insert(name.to_string(), script);
        self
    }

    /// Use `script` for the next launch of `name` only.
    pub fn queue(self, name: &str, script: FakeServer) -> Self {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push_back(script);
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        Arc::clone(&self.stats)
    }

    fn script_for(&self, name: &str) -> FakeServer {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
            .and_then(VecDeque::pop_front);
        queued
            .or_else(|| self.named.get(name).cloned())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, name: &str, _config: &ServerConfig) -> Result<LaunchedProcess, McpError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let script = self.script_for(name);

        let (client_writer, server_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (server_writer, client_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(serve(
            script,
            server_reader,
            server_writer,
            Arc::clone(&self.stats),
            Arc::clone(&alive),
        ));

        Ok(LaunchedProcess {
            reader: Box::new(client_reader),
            writer: Box::new(client_writer),
            handle: Box::new(FakeHandle { alive, task }),
            stderr: None,
        })
    }
}

// ─── Scripted Model Backend ─────────────────────────────────────────────────

type ReplyFn = Arc<dyn Fn(&GenerateRequest) -> Result<String, InferenceError> + Send + Sync>;

#[derive(Clone)]
enum Reply {
    Text(String),
    Unavailable,
    Func(ReplyFn),
}

impl Reply {
    fn produce(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
        match self {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Unavailable => Err(InferenceError::AllModelsUnavailable {
                attempted: vec!["fast-model".into(), "full-model".into()],
            }),
            Reply::Func(f) => f(request),
        }
    }
}

/// Model backend answering from per-purpose scripts.
///
/// One-shot replies queued with [`then`](Self::then) go first; after that
/// the purpose's standing reply applies. An unscripted call is a malformed
/// response.
#[derive(Default)]
pub struct ScriptedBackend {
    queued: Mutex<HashMap<CallPurpose, VecDeque<Reply>>>,
    standing: HashMap<CallPurpose, Reply>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, purpose: CallPurpose, text: &str) -> Self {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(purpose)
            .or_default()
            .push_back(Reply::Text(text.to_string()));
        self
    }

    pub fn always(mut self, purpose: CallPurpose, text: &str) -> Self {
        self.standing.insert(purpose, Reply::Text(text.to_string()));
        self
    }

    pub fn unavailable(mut self, purpose: CallPurpose) -> Self {
        self.standing.insert(purpose, Reply::Unavailable);
        self
    }

    pub fn respond<F>(mut self, purpose: CallPurpose, f: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<String, InferenceError> + Send + Sync + 'static,
    {
        self.standing.insert(purpose, Reply::Func(Arc::new(f)));
        self
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn requests_for(&self, purpose: CallPurpose) -> Vec<GenerateRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.purpose == purpose)
            .collect()
    }

    pub fn calls_for(&self, purpose: CallPurpose) -> usize {
        self.requests_for(purpose).len()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<String, InferenceError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front);

        match queued.or_else(|| self.standing.get(&request.purpose).cloned()) {
            Some(reply) => reply.produce(&request),
            None => Err(InferenceError::MalformedResponse {
                reason: format!("no scripted reply for {:?}", request.purpose),
            }),
        }
    }
}

// ─── Collecting Sink ────────────────────────────────────────────────────────

/// Records every sink write.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<SinkEvent>,
    fail_after: Option<usize>,
}

impl CollectingSink {
    /// A sink whose receiver goes away after `writes` successful writes.
    pub fn failing_after(writes: usize) -> Self {
        Self {
            events: Vec::new(),
            fail_after: Some(writes),
        }
    }

    fn push(&mut self, event: SinkEvent) -> Result<(), SinkError> {
        if self.fail_after.is_some_and(|limit| self.events.len() >= limit) {
            return Err(SinkError::Closed);
        }
        self.events.push(event);
        Ok(())
    }

    /// Concatenated chunk text.
    pub fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Chunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    async fn write_header(&mut self, text: &str) -> Result<(), SinkError> {
        self.push(SinkEvent::Header { text: text.to_string() })
    }

    async fn write_chunk(&mut self, text: &str) -> Result<(), SinkError> {
        self.push(SinkEvent::Chunk { text: text.to_string() })
    }

    async fn end(&mut self, total_length: usize) -> Result<(), SinkError> {
        self.push(SinkEvent::End { total_length })
    }
}
