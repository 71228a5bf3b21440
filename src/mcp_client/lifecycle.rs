//! Tool server process lifecycle.
//!
//! Spawning goes through the [`Launcher`] seam so the same handshake and
//! state tracking run against real child processes and in-memory test
//! servers. A [`ManagedProcess`] owns its transport and process handle and
//! moves through `Starting → Ready ⇄ Degraded → Terminated`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use uuid::Uuid;

use super::errors::McpError;
use super::transport::Transport;
use super::types::{
    CallToolResult, InitializeResult, ListToolsResult, McpToolDefinition, PoolSettings,
    ServerConfig, ServerInfo, MCP_PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Client identity sent in `initialize`.
const CLIENT_NAME: &str = "toolrelay";

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period when tearing down a process whose handshake failed.
const ABORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on `tools/list` pages followed via `nextCursor`.
const MAX_TOOL_PAGES: usize = 32;

/// Stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Stderr characters included in an error message.
const STDERR_TAIL_CHARS: usize = 2000;

// ─── Launcher Seam ───────────────────────────────────────────────────────────

/// Liveness and teardown of whatever sits behind a transport.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Wait up to `grace` for a voluntary exit, then kill.
    async fn terminate(&mut self, grace: Duration);
}

/// Streams and handle for a freshly started tool server.
pub struct LaunchedProcess {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub handle: Box<dyn ProcessHandle>,
    pub stderr: Option<StderrTail>,
}

/// Starts tool server processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, name: &str, config: &ServerConfig) -> Result<LaunchedProcess, McpError>;
}

/// Launches tool servers as child processes speaking JSON-RPC over stdio.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    working_dir: Option<PathBuf>,
}

impl CommandLauncher {
    /// `working_dir` applies to servers without their own `cwd`.
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, name: &str, config: &ServerConfig) -> Result<LaunchedProcess, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args).envs(&config.env);

        // Per-server cwd overrides the global working_dir
        let effective_dir = config
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone());
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(name.to_string(), stderr, tail.clone()));
        }

        tracing::debug!(server = name, pid = ?child.id(), command = %config.command, "spawned tool server");

        Ok(LaunchedProcess {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            handle: Box::new(ChildHandle { child }),
            stderr: Some(tail),
        })
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            if let Err(e) = self.child.kill().await {
                tracing::debug!(error = %e, "failed to kill tool server");
            }
        }
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Last few stderr lines of a tool server, kept for error messages.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Joined tail, truncated to keep log lines readable.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut text = lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if text.len() > STDERR_TAIL_CHARS {
            let mut cut = STDERR_TAIL_CHARS;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...(truncated)");
        }
        text
    }
}

/// Forward stderr into the log so the child never blocks on a full pipe.
async fn drain_stderr(server: String, stderr: tokio::process::ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(server = %server, stderr = %line, "tool server stderr");
                tail.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── ManagedProcess ──────────────────────────────────────────────────────────

/// Lifecycle state of a managed tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, handshake in progress.
    Starting,
    /// Handshake complete, last call (if any) went through.
    Ready,
    /// The last write to the server failed but the process still runs.
    Degraded,
    /// Process exited or its stream closed. Needs a respawn.
    Terminated,
}

/// A running tool server with its transport and advertised tools.
pub struct ManagedProcess {
    id: Uuid,
    name: String,
    transport: Transport,
    handle: Box<dyn ProcessHandle>,
    state: ProcessState,
    tools: Vec<McpToolDefinition>,
    server_info: Option<ServerInfo>,
    started_at: DateTime<Utc>,
}

impl ManagedProcess {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Tool definitions received during the handshake.
    pub fn tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Time since the process was launched.
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    /// Refresh liveness; a dead process or closed stream becomes `Terminated`.
    pub fn is_alive(&mut self) -> bool {
        if self.state != ProcessState::Terminated
            && (self.transport.is_closed() || !self.handle.is_alive())
        {
            tracing::warn!(
                server = %self.name,
                process_id = %self.id,
                uptime_secs = self.uptime().num_seconds(),
                "tool server is no longer running"
            );
            self.state = ProcessState::Terminated;
        }
        self.state != ProcessState::Terminated
    }

    /// Invoke one tool. Callers serialize access; see the process pool.
    ///
    /// A per-call timeout leaves the process `Ready`. A closed stream marks it
    /// `Terminated` and a failed write marks it `Degraded`. The failing call
    /// is never retried here.
    pub async fn call_tool(
        &mut self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult, McpError> {
        let params = json!({ "name": tool, "arguments": arguments });

        let value = match self.transport.call("tools/call", Some(params), timeout).await {
            Ok(value) => value,
            Err(e @ McpError::TransportClosed { .. }) => {
                self.state = ProcessState::Terminated;
                return Err(e);
            }
            Err(e @ McpError::TransportError { .. }) => {
                self.state = ProcessState::Degraded;
                return Err(e);
            }
            Err(McpError::ServerError { code, message, .. }) => {
                self.state = ProcessState::Ready;
                return Err(McpError::ToolExecutionFailed {
                    tool: tool.to_string(),
                    message: format!("[{code}] {message}"),
                });
            }
            Err(e) => return Err(e),
        };

        self.state = ProcessState::Ready;
        let result: CallToolResult =
            serde_json::from_value(value).map_err(|e| McpError::ToolExecutionFailed {
                tool: tool.to_string(),
                message: format!("malformed tools/call result: {e}"),
            })?;

        if result.is_error {
            return Err(McpError::ToolExecutionFailed {
                tool: tool.to_string(),
                message: result.text(),
            });
        }
        Ok(result)
    }

    /// Close stdin, give the server time to exit, then kill it.
    pub async fn shutdown(&mut self) {
        self.stop(SHUTDOWN_TIMEOUT).await;
        tracing::info!(
            server = %self.name,
            process_id = %self.id,
            uptime_secs = self.uptime().num_seconds(),
            "tool server stopped"
        );
    }

    async fn stop(&mut self, grace: Duration) {
        self.transport.close().await;
        self.handle.terminate(grace).await;
        self.state = ProcessState::Terminated;
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Launch a tool server and run the startup handshake.
///
/// On failure the process is torn down before returning. An empty tool list
/// is reported as [`McpError::NoToolsAdvertised`]; everything else that goes
/// wrong after launch is a [`McpError::HandshakeFailed`].
pub async fn spawn_process(
    name: &str,
    config: &ServerConfig,
    launcher: &dyn Launcher,
    settings: &PoolSettings,
) -> Result<ManagedProcess, McpError> {
    let LaunchedProcess {
        reader,
        writer,
        handle,
        stderr,
    } = launcher.launch(name, config).await?;

    let mut process = ManagedProcess {
        id: Uuid::new_v4(),
        name: name.to_string(),
        transport: Transport::new(name, reader, writer),
        handle,
        state: ProcessState::Starting,
        tools: Vec::new(),
        server_info: None,
        started_at: Utc::now(),
    };

    match handshake(&process.transport, name, config, settings).await {
        Ok((server_info, tools)) => {
            tracing::info!(
                server = name,
                process_id = %process.id,
                tools = tools.len(),
                server_name = ?server_info.as_ref().and_then(|i| i.name.as_deref()),
                "tool server ready"
            );
            process.server_info = server_info;
            process.tools = tools;
            process.state = ProcessState::Ready;
            Ok(process)
        }
        Err(e) => {
            process.stop(ABORT_TIMEOUT).await;
            let stderr_ctx = stderr.map(|tail| tail.snapshot()).unwrap_or_default();
            if !stderr_ctx.is_empty() {
                tracing::warn!(server = name, stderr = %stderr_ctx, "server stderr captured on failure");
            }
            Err(match e {
                McpError::NoToolsAdvertised { .. } => e,
                McpError::HandshakeFailed { name, reason } => McpError::HandshakeFailed {
                    name,
                    reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
                },
                other => McpError::HandshakeFailed {
                    name: name.to_string(),
                    reason: format!("{other}{}", format_stderr_suffix(&stderr_ctx)),
                },
            })
        }
    }
}

/// initialize → initialized → readiness → tools/list, strictly in order.
async fn handshake(
    transport: &Transport,
    name: &str,
    config: &ServerConfig,
    settings: &PoolSettings,
) -> Result<(Option<ServerInfo>, Vec<McpToolDefinition>), McpError> {
    let params = json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
    });
    let result = transport
        .call("initialize", Some(params), settings.call_timeout())
        .await?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::HandshakeFailed {
            name: name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;
    tracing::debug!(server = name, protocol = ?init.protocol_version, "initialize acknowledged");

    transport.notify("notifications/initialized", None).await?;

    if let Some(method) = &config.ready_notification {
        tracing::info!(server = name, method = %method, "waiting for server readiness");
        transport
            .wait_for_notification(method, settings.ready_timeout())
            .await?;
    }

    let tools = list_tools(transport, name, settings.ready_timeout()).await?;
    if tools.is_empty() {
        return Err(McpError::NoToolsAdvertised {
            name: name.to_string(),
        });
    }
    Ok((init.server_info, tools))
}

/// Fetch every `tools/list` page.
async fn list_tools(
    transport: &Transport,
    name: &str,
    timeout: Duration,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let value = transport.call("tools/list", params, timeout).await?;
        let page: ListToolsResult =
            serde_json::from_value(value).map_err(|e| McpError::HandshakeFailed {
                name: name.to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(server = name, pages = MAX_TOOL_PAGES, "tools/list pagination cut short");
    Ok(tools)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
