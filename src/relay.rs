//! Composition root.
//!
//! A [`Relay`] owns the long-lived [`ProcessPool`] and one [`PlanEngine`]
//! holding an `Arc` to it. Each inbound request becomes one engine run
//! with its own sink and cancellation token; runs share nothing but the
//! pool, whose per-server locks do the arbitration.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::agent_core::{ApprovalGate, EngineConfig, PlanEngine, PlanOutcome, PlanRequest, Sink};
use crate::config::RelayConfig;
use crate::inference::{InferenceClient, InferenceError, ModelBackend};
use crate::mcp_client::{McpError, ProcessPool, ServerHealth};

pub struct Relay {
    pool: Arc<ProcessPool>,
    engine: Arc<PlanEngine>,
}

impl Relay {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        pool: Arc<ProcessPool>,
        approval: Arc<dyn ApprovalGate>,
        engine_config: EngineConfig,
    ) -> Self {
        let engine = PlanEngine::new(backend, Arc::clone(&pool), approval, engine_config);
        Self {
            pool,
            engine: Arc::new(engine),
        }
    }

    /// Wire the HTTP model backend and a child-process pool from config.
    pub fn from_config(config: &RelayConfig, approval: Arc<dyn ApprovalGate>) -> Result<Self, InferenceError> {
        let backend = Arc::new(InferenceClient::from_config(config.models.clone())?);
        let pool = ProcessPool::new(config.servers_config(), config.pool.clone(), config.working_dir())
            .with_enabled_tools(config.enabled_tool_set());
        Ok(Self::new(backend, Arc::new(pool), approval, config.engine.clone()))
    }

    /// Start every configured server. Failures are logged and returned;
    /// failed servers are retried on first use.
    pub async fn start(&self) -> Vec<(String, McpError)> {
        let failures = self.pool.start_all().await;
        let registry = self.pool.registry();
        tracing::info!(
            ready = self.pool.ready_servers().len(),
            failed = failures.len(),
            tools = registry.len(),
            "relay started"
        );
        for (server, error) in &failures {
            tracing::warn!(server = %server, error = %error, "server failed to start");
        }
        failures
    }

    pub fn health(&self) -> Vec<ServerHealth> {
        self.pool.health()
    }

    /// Run one request on its own task.
    ///
    /// The sink is handed back with the outcome.
    pub fn spawn_request<S>(&self, request: PlanRequest, sink: S) -> RequestHandle<S>
    where
        S: Sink + 'static,
    {
        let cancel = CancellationToken::new();
        let engine = Arc::clone(&self.engine);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut sink = sink;
            let outcome = engine.run(request, &mut sink, token).await;
            (outcome, sink)
        });
        RequestHandle { cancel, task }
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown_all().await;
        tracing::info!("relay stopped");
    }
}

/// An in-flight request.
pub struct RequestHandle<S> {
    cancel: CancellationToken,
    task: JoinHandle<(PlanOutcome, S)>,
}

impl<S> RequestHandle<S> {
    /// The client went away. Nothing more is written to the sink.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<(PlanOutcome, S), JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::agent_core::{AutoApprove, ChannelSink, PlanStatus, SinkEvent};
    use crate::inference::CallPurpose;
    use crate::mcp_client::{McpServersConfig, PoolSettings};
    use crate::test_support::{server_config, CollectingSink, FakeLauncher, FakeServer, ScriptedBackend};

    fn relay(backend: ScriptedBackend) -> (Relay, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new(FakeServer::with_tools(&["echo"])));
        let servers = McpServersConfig {
            servers: HashMap::from([("fs".to_string(), server_config())]),
        };
        let pool = ProcessPool::with_launcher(servers, PoolSettings::default(), launcher.clone());
        let relay = Relay::new(
            Arc::new(backend),
            Arc::new(pool),
            Arc::new(AutoApprove),
            EngineConfig::default(),
        );
        (relay, launcher)
    }

    fn echo_backend() -> ScriptedBackend {
        ScriptedBackend::new()
            .always(
                CallPurpose::Planning,
                r#"{"objective": "echo", "step": {"objective": "echo", "tool": "echo", "instruction": "echo hi"}}"#,
            )
            .always(CallPurpose::Arguments, r#"{"text": "hi"}"#)
            .always(CallPurpose::Decision, r#"{"action": "conclude", "answer": "Done."}"#)
    }

    #[tokio::test]
    async fn test_spawned_request_streams_to_channel() {
        let (relay, _launcher) = relay(echo_backend());
        assert!(relay.start().await.is_empty());

        let (sink, mut events) = ChannelSink::new(32);
        let handle = relay.spawn_request(PlanRequest::new("echo hi"), sink);
        let (outcome, _sink) = handle.wait().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Answered);
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.first(), Some(&SinkEvent::Header { text: "Step 1: echo".into() }));
        assert!(matches!(received.last(), Some(SinkEvent::End { .. })));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_process() {
        let (relay, launcher) = relay(echo_backend());
        assert!(relay.start().await.is_empty());
        let handles: Vec<_> = (0..3)
            .map(|i| relay.spawn_request(PlanRequest::new(format!("echo {i}")), CollectingSink::default()))
            .collect();
        for handle in handles {
            let (outcome, sink) = handle.wait().await.unwrap();
            assert_eq!(outcome.status, PlanStatus::Answered);
            assert_eq!(sink.text().matches("Done.").count(), 1);
        }
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.stats().tool_calls(), 3);
        assert_eq!(launcher.stats().max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let (relay, _launcher) = relay(echo_backend());
        let handle = relay.spawn_request(PlanRequest::new("echo"), CollectingSink::default());
        handle.cancel();
        let (outcome, sink) = handle.wait().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Cancelled);
        assert!(sink.events.is_empty());
    }
}
