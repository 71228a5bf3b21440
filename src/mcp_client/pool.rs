//! Process pool: the long-lived set of tool servers shared by all requests.
//!
//! Each configured server gets one slot guarded by an async mutex. Every
//! `execute` holds that mutex for the whole call, so concurrent callers
//! queue behind each other on one server while different servers proceed
//! in parallel. The same mutex covers lazy (re)spawning: a slot whose
//! process died is respawned and re-handshaken by the next caller.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{MappedMutexGuard, Mutex as TokioMutex, MutexGuard};

use super::errors::McpError;
use super::lifecycle::{spawn_process, CommandLauncher, Launcher, ManagedProcess, ProcessState};
use super::registry::{ToolDescriptor, ToolRegistry};
use super::types::{CallToolResult, McpServersConfig, McpToolDefinition, PoolSettings, ServerConfig};

// ─── Pool Entries ────────────────────────────────────────────────────────────

struct PoolEntry {
    config: ServerConfig,
    slot: TokioMutex<Slot>,
    /// Mirrors "slot holds a Ready process" without taking the lock.
    ready: AtomicBool,
    restarts: AtomicU32,
}

#[derive(Default)]
struct Slot {
    process: Option<ManagedProcess>,
    disabled_until: Option<Instant>,
}

/// Point-in-time health of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHealth {
    pub name: String,
    pub ready: bool,
    pub tools: usize,
    pub restarts: u32,
}

// ─── ProcessPool ─────────────────────────────────────────────────────────────

/// Supervises every configured tool server and routes tool calls to them.
pub struct ProcessPool {
    entries: HashMap<String, Arc<PoolEntry>>,
    registry: RwLock<ToolRegistry>,
    enabled_tools: Option<HashSet<String>>,
    launcher: Arc<dyn Launcher>,
    settings: PoolSettings,
}

impl ProcessPool {
    /// Pool that runs servers as child processes.
    pub fn new(config: McpServersConfig, settings: PoolSettings, working_dir: Option<PathBuf>) -> Self {
        Self::with_launcher(config, settings, Arc::new(CommandLauncher::new(working_dir)))
    }

    /// Pool with a custom launcher.
    pub fn with_launcher(
        config: McpServersConfig,
        settings: PoolSettings,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let entries = config
            .servers
            .into_iter()
            .map(|(name, config)| {
                let entry = PoolEntry {
                    config,
                    slot: TokioMutex::new(Slot::default()),
                    ready: AtomicBool::new(false),
                    restarts: AtomicU32::new(0),
                };
                (name, Arc::new(entry))
            })
            .collect();

        Self {
            entries,
            registry: RwLock::new(ToolRegistry::new()),
            enabled_tools: None,
            launcher,
            settings,
        }
    }

    /// Only register tools named in `allowed`.
    pub fn with_enabled_tools(mut self, allowed: Option<HashSet<String>>) -> Self {
        self.enabled_tools = allowed;
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn and handshake every configured server concurrently.
    ///
    /// Returns the servers that failed (partial startup is OK; failed
    /// servers are retried lazily on their next `execute`).
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let attempts = self.entries.keys().map(|name| async move {
            let outcome = self.acquire(name).await.map(|_| ());
            (name.clone(), outcome)
        });

        let errors: Vec<(String, McpError)> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(name, outcome)| outcome.err().map(|e| (name, e)))
            .collect();

        tracing::info!(
            servers = self.entries.len(),
            failed = errors.len(),
            tools = self.read_registry().len(),
            "process pool started"
        );
        errors
    }

    /// Return the server's process, spawning and handshaking it if needed.
    ///
    /// The returned guard holds the server's mutex; drop it to let the next
    /// caller in.
    pub async fn acquire(&self, server: &str) -> Result<MappedMutexGuard<'_, ManagedProcess>, McpError> {
        let entry = self.entry(server)?;
        let mut slot = entry.slot.lock().await;
        self.ensure_running(server, entry, &mut slot).await?;

        MutexGuard::try_map(slot, |slot| slot.process.as_mut()).map_err(|_| McpError::SpawnFailed {
            name: server.to_string(),
            reason: "no process after successful spawn".into(),
        })
    }

    /// Stop one server and forget its tools.
    pub async fn shutdown(&self, server: &str) -> Result<(), McpError> {
        let entry = self.entry(server)?;
        let mut slot = entry.slot.lock().await;
        if let Some(mut process) = slot.process.take() {
            process.shutdown().await;
        }
        entry.ready.store(false, Ordering::Release);
        self.write_registry().unregister_server(server);
        Ok(())
    }

    /// Stop every server.
    pub async fn shutdown_all(&self) {
        let names: Vec<&String> = self.entries.keys().collect();
        for name in names {
            if let Err(e) = self.shutdown(name).await {
                tracing::warn!(server = %name, error = %e, "shutdown failed");
            }
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Run one tool on one server, serialized against other calls to it.
    ///
    /// `timeout` defaults to the configured per-call timeout. A failing call
    /// is not retried; a server that died is respawned on the next call.
    pub async fn execute(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, McpError> {
        let entry = self.entry(server)?;
        let timeout = timeout.unwrap_or_else(|| self.settings.call_timeout());
        let started = Instant::now();

        let mut process = self.acquire(server).await?;
        let result = process.call_tool(tool, arguments, timeout).await;
        let state = process.state();
        drop(process);

        entry.ready.store(state == ProcessState::Ready, Ordering::Release);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(server, tool, elapsed_ms, "tool call succeeded"),
            Err(e) => tracing::warn!(server, tool, elapsed_ms, error = %e, state = ?state, "tool call failed"),
        }
        result
    }

    /// Run a tool by name, routed to whichever server owns it.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, McpError> {
        let server = self
            .read_registry()
            .server_for(tool)
            .map(str::to_string)
            .ok_or_else(|| McpError::UnknownTool {
                name: tool.to_string(),
            })?;
        self.execute(&server, tool, arguments, timeout).await
    }

    // ─── Health & Registry ───────────────────────────────────────────────

    /// Whether a server has a ready process.
    pub fn ready(&self, server: &str) -> bool {
        self.entries
            .get(server)
            .is_some_and(|entry| entry.ready.load(Ordering::Acquire))
    }

    /// Names of all ready servers, sorted.
    pub fn ready_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.ready.load(Ordering::Acquire))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Per-server health snapshot, sorted by name.
    pub fn health(&self) -> Vec<ServerHealth> {
        let registry = self.read_registry();
        let mut health: Vec<ServerHealth> = self
            .entries
            .iter()
            .map(|(name, entry)| ServerHealth {
                name: name.clone(),
                ready: entry.ready.load(Ordering::Acquire),
                tools: registry.tools_for_server(name),
                restarts: entry.restarts.load(Ordering::Relaxed),
            })
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    /// Snapshot of the merged tool registry.
    ///
    /// Descriptors of a crashed server stay listed until its respawn
    /// replaces them, so selection still routes to it.
    pub fn registry(&self) -> ToolRegistry {
        self.read_registry().clone()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn entry(&self, server: &str) -> Result<&Arc<PoolEntry>, McpError> {
        self.entries.get(server).ok_or_else(|| McpError::UnknownServer {
            name: server.to_string(),
        })
    }

    async fn ensure_running(&self, server: &str, entry: &PoolEntry, slot: &mut Slot) -> Result<(), McpError> {
        if let Some(until) = slot.disabled_until {
            let now = Instant::now();
            if now < until {
                return Err(McpError::ServerDisabled {
                    name: server.to_string(),
                    remaining_secs: (until - now).as_secs().max(1),
                });
            }
            slot.disabled_until = None;
        }

        match slot.process.as_mut().map(|p| p.is_alive()) {
            Some(true) => return Ok(()),
            Some(false) => {
                entry.ready.store(false, Ordering::Release);
                entry.restarts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(server, "tool server terminated, respawning");
                if let Some(mut dead) = slot.process.take() {
                    dead.shutdown().await;
                }
            }
            None => {}
        }

        match spawn_process(server, &entry.config, self.launcher.as_ref(), &self.settings).await {
            Ok(process) => {
                self.register_tools(server, &entry.config, process.tools());
                slot.process = Some(process);
                entry.ready.store(true, Ordering::Release);
                Ok(())
            }
            Err(e @ McpError::NoToolsAdvertised { .. }) => {
                let disable_for = self.settings.disable_for();
                tracing::warn!(server, disable_secs = disable_for.as_secs(), "server advertised no tools, disabling");
                slot.disabled_until = Some(Instant::now() + disable_for);
                self.write_registry().unregister_server(server);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(server, error = %e, "tool server failed to start");
                Err(e)
            }
        }
    }

    fn register_tools(&self, server: &str, config: &ServerConfig, tools: &[McpToolDefinition]) {
        let descriptors: Vec<ToolDescriptor> = tools
            .iter()
            .filter(|def| {
                self.enabled_tools
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(&def.name))
            })
            .map(|def| ToolDescriptor::from_definition(def, config))
            .collect();

        let mut registry = self.write_registry();
        registry.unregister_server(server);
        let accepted = registry.register_server_tools(server, descriptors);
        tracing::debug!(server, advertised = tools.len(), registered = accepted, "registered tools");
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, ToolRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, ToolRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
