//! CLI entrypoint for ToolRelay.
//!
//! Loads the config, starts the tool servers, runs one instruction through
//! the plan engine, and streams the result to stdout. Logs go to stderr
//! (or the log file) so stdout carries only the answer.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use toolrelay::agent_core::{
    ApprovalGate, AutoApprove, ChannelApproval, ConfirmationResponse, PendingApproval, PlanRequest,
    PlanStatus, WriterSink,
};
use toolrelay::config::{find_config_path, RelayConfig};
use toolrelay::inference::{InferenceClient, ModelTier};
use toolrelay::{logging, Relay};

#[derive(Parser, Debug)]
#[command(name = "toolrelay")]
#[command(author, version, about = "Run an instruction through supervised tool servers and an iterative plan engine")]
#[command(long_about = r#"
ToolRelay plans an instruction with a language model, runs tools exposed by
MCP tool servers one step at a time, and streams the answer to stdout.

Configuration is loaded from (in priority order):
1. --config <path>
2. $TOOLRELAY_CONFIG
3. ./toolrelay.yaml or any parent directory
4. <config dir>/toolrelay/config.yaml

Example:
  toolrelay "List the PDFs in ~/Downloads and summarize the newest one"
  toolrelay --check
"#)]
struct Cli {
    /// The instruction to carry out
    instruction: Vec<String>,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Extra context passed to the planner
    #[arg(long, value_name = "TEXT")]
    context: Option<String>,

    /// Approve every confirm-class tool call without asking
    #[arg(short, long)]
    yes: bool,

    /// Start the tool servers, report readiness, and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir()?;
    let config_path = find_config_path(cli.config.as_deref(), &cwd)?;
    let config = RelayConfig::load(&config_path)?;
    logging::init_tracing(&config.logging)?;
    tracing::info!(config = %config_path.display(), "configuration loaded");

    if cli.check {
        return check(&config).await;
    }

    if cli.instruction.is_empty() {
        bail!("An instruction is required. Use --check to only verify the setup.");
    }

    let approval: Arc<dyn ApprovalGate> = if cli.yes {
        Arc::new(AutoApprove)
    } else {
        let (gate, pending) = ChannelApproval::new(Duration::from_secs(config.approval_timeout_secs));
        tokio::spawn(prompt_for_approvals(pending));
        Arc::new(gate)
    };

    let relay = Relay::from_config(&config, approval).context("failed to set up the model backend")?;
    for (server, error) in relay.start().await {
        eprintln!("warning: server '{server}' is not ready: {error}");
    }

    let mut request = PlanRequest::new(cli.instruction.join(" "));
    if let Some(context) = cli.context {
        request = request.with_context(context);
    }

    let handle = relay.spawn_request(request, WriterSink::new(tokio::io::stdout()));
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling request");
            cancel.cancel();
        }
    });

    let (outcome, _sink) = handle.wait().await.context("request task failed")?;
    relay.shutdown().await;

    Ok(match outcome.status {
        PlanStatus::Answered | PlanStatus::ForcedConclusion => ExitCode::SUCCESS,
        PlanStatus::Cancelled => ExitCode::from(130),
        PlanStatus::Failed => ExitCode::FAILURE,
    })
}

/// `--check`: model endpoints and tool servers, one line each.
async fn check(config: &RelayConfig) -> Result<ExitCode> {
    let client = InferenceClient::from_config(config.models.clone())?;
    let mut healthy = true;
    for tier in [ModelTier::Fast, ModelTier::Full] {
        let ok = client.health_check(tier).await;
        healthy &= ok;
        println!(
            "model  {:<5} {:<24} {}",
            tier.to_string(),
            config.models.model_key(tier),
            if ok { "reachable" } else { "UNREACHABLE" }
        );
    }

    let relay = Relay::from_config(config, Arc::new(AutoApprove))?;
    let failures = relay.start().await;
    let mut health = relay.health();
    health.sort_by(|a, b| a.name.cmp(&b.name));
    for server in &health {
        println!(
            "server {:<30} {:<9} tools={}",
            server.name,
            if server.ready { "ready" } else { "NOT READY" },
            server.tools
        );
    }
    for (server, error) in &failures {
        println!("  {server}: {error}");
    }
    relay.shutdown().await;

    healthy &= failures.is_empty();
    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Ask on the terminal for every confirm-class tool call.
async fn prompt_for_approvals(mut pending: mpsc::Receiver<PendingApproval>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(approval) = pending.recv().await {
        let request = &approval.request;
        eprintln!(
            "\nTool '{}' wants to run: {}\nArguments: {}\nAllow? [y/N] ",
            request.tool_name, request.preview, request.arguments
        );
        let answer = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => String::new(),
        };
        let response = if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            ConfirmationResponse::Confirmed
        } else {
            ConfirmationResponse::Rejected
        };
        approval.respond(response);
    }
}
