//! Approval round trip for confirm-class tools.
//!
//! The engine asks an [`ApprovalGate`] before executing any tool whose
//! safety class is `confirm`. How the question reaches a person is up to
//! the gate; [`ChannelApproval`] hands it to whoever holds the receiver.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::agent_core::types::{ConfirmationRequest, ConfirmationResponse};

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationResponse;
}

/// Approves everything. For trusted, non-interactive runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationResponse {
        ConfirmationResponse::Confirmed
    }
}

/// Rejects everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationResponse {
        tracing::info!(tool = %request.tool_name, "confirmation denied (deny-all gate)");
        ConfirmationResponse::Rejected
    }
}

/// A confirmation waiting for an answer.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ConfirmationRequest,
    responder: oneshot::Sender<ConfirmationResponse>,
}

impl PendingApproval {
    pub fn respond(self, response: ConfirmationResponse) {
        if self.responder.send(response).is_err() {
            tracing::debug!(request_id = %self.request.request_id, "approval answered after the request gave up");
        }
    }
}

/// Forwards confirmations over a channel and waits for the answer.
///
/// No answer within the timeout, or a dropped receiver, counts as rejection.
#[derive(Debug, Clone)]
pub struct ChannelApproval {
    requests: mpsc::Sender<PendingApproval>,
    timeout: Duration,
}

impl ChannelApproval {
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (requests, rx) = mpsc::channel(8);
        (Self { requests, timeout }, rx)
    }
}

#[async_trait]
impl ApprovalGate for ChannelApproval {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationResponse {
        let tool = request.tool_name.clone();
        let (responder, answer) = oneshot::channel();

        if self
            .requests
            .send(PendingApproval { request, responder })
            .await
            .is_err()
        {
            tracing::warn!(tool = %tool, "no approver listening, rejecting");
            return ConfirmationResponse::Rejected;
        }

        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                tracing::warn!(tool = %tool, "approver dropped the request, rejecting");
                ConfirmationResponse::Rejected
            }
            Err(_) => {
                tracing::warn!(tool = %tool, timeout_secs = self.timeout.as_secs(), "confirmation timed out, rejecting");
                ConfirmationResponse::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ConfirmationRequest {
        ConfirmationRequest {
            request_id: "r1".into(),
            tool_name: "delete_file".into(),
            arguments: json!({"path": "/tmp/x"}),
            preview: "Delete /tmp/x".into(),
        }
    }

    #[tokio::test]
    async fn test_channel_approval_round_trip() {
        let (gate, mut rx) = ChannelApproval::new(Duration::from_secs(1));
        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.tool_name, "delete_file");
            pending.respond(ConfirmationResponse::EditedAndConfirmed {
                new_arguments: json!({"path": "/tmp/y"}),
            });
        });

        match gate.confirm(request()).await {
            ConfirmationResponse::EditedAndConfirmed { new_arguments } => {
                assert_eq!(new_arguments["path"], "/tmp/y");
            }
            other => panic!("expected edited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_approval_rejects_on_timeout_or_drop() {
        let (gate, _rx) = ChannelApproval::new(Duration::from_millis(20));
        assert!(matches!(gate.confirm(request()).await, ConfirmationResponse::Rejected));

        let (gate, rx) = ChannelApproval::new(Duration::from_secs(1));
        drop(rx);
        assert!(matches!(gate.confirm(request()).await, ConfirmationResponse::Rejected));
    }

    #[tokio::test]
    async fn test_static_gates() {
        assert!(matches!(AutoApprove.confirm(request()).await, ConfirmationResponse::Confirmed));
        assert!(matches!(DenyAll.confirm(request()).await, ConfirmationResponse::Rejected));
    }
}
