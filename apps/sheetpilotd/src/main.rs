use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use sheetpilot_approval::ApprovalMode;
use sheetpilot_events::NotificationFilter;
use sheetpilot_kernel::{KernelBuilder, KernelConfig, SessionContext};
use sheetpilot_protocol::{
    ApprovalResponse, ApprovalSurface, ApprovalTicket, CoreError, CoreResult, Envelope,
    ResponsePayload,
};
use sheetpilot_tools::{DEFAULT_SHEET, InMemoryGridBackend};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "sheetpilotd")]
#[command(about = "sheetpilot orchestration demo daemon")]
struct Cli {
    /// JSON kernel configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for persisted ledger snapshots.
    #[arg(long)]
    store: Option<PathBuf>,
    /// Approve every gated call without asking.
    #[arg(long)]
    auto_approve: bool,
    #[arg(long, default_value = "info")]
    log_filter: String,
}

/// Asks on stdin: `y` approves, `n` denies, a JSON object approves with edits.
struct StdinApprovalSurface {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinApprovalSurface {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl ApprovalSurface for StdinApprovalSurface {
    async fn present(&self, ticket: ApprovalTicket) -> CoreResult<ApprovalResponse> {
        eprintln!(
            "\n[approval {}] {}\n{}\napprove? [y/n/json] ",
            ticket.approval_id,
            ticket.request.title,
            serde_json::to_string_pretty(&ticket.request.payload)?
        );
        let line = self
            .lines
            .lock()
            .await
            .next_line()
            .await
            .map_err(|error| CoreError::Internal(format!("stdin: {error}")))?
            .unwrap_or_default();

        let answer = line.trim();
        Ok(match answer {
            "y" | "yes" => ApprovalResponse::approve(),
            "" | "n" | "no" => ApprovalResponse::deny("declined at prompt"),
            edited => ApprovalResponse::approve_with(serde_json::from_str(edited)?),
        })
    }
}

async fn rpc(context: &SessionContext, id: i64, method: &str, params: Value) -> Result<Value> {
    let envelope = Envelope::from_value(json!({
        "jsonrpc": "2.0", "id": id, "method": method, "params": params
    }))?;
    let Some(Envelope::Response(response)) = context.handle_envelope(envelope).await else {
        bail!("{method} produced no response");
    };
    match response.payload {
        ResponsePayload::Result(result) => Ok(result),
        ResponsePayload::Error(error) => Err(error).with_context(|| format!("{method} failed")),
    }
}

async fn write(context: &SessionContext, id: i64, target: &str, value: Value) -> Result<Value> {
    rpc(
        context,
        id,
        "tools/call",
        json!({ "name": "excel/write-value", "arguments": { "target": target, "value": value } }),
    )
    .await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log_filter))
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => KernelConfig::from_json_file(path)?,
        None => KernelConfig::default(),
    };
    if let Some(root) = cli.store.clone() {
        config.persistence.root = Some(root);
    }

    let grid = Arc::new(InMemoryGridBackend::new("excel", "excel"));
    let mut builder = KernelBuilder::new(config).backend(grid.clone());
    builder = if cli.auto_approve {
        builder.approval_mode(ApprovalMode::AutoApprove)
    } else {
        builder.approval_surface(Arc::new(StdinApprovalSurface::new()))
    };
    let kernel = builder.build();

    let context = kernel.create_session().await?;
    context.subscribe(NotificationFilter::all(), |notification| {
        info!(
            source = %notification.source,
            event = %notification.event,
            category = %notification.category.as_str(),
            priority = ?notification.priority,
            "{}",
            notification.message
        );
        Ok(())
    });

    let init = rpc(&context, 1, "initialize", json!({})).await?;
    info!(session_id = %context.session_id(), tools = %init["capabilities"]["tools"], "session initialized");

    write(&context, 2, "A1", json!(5)).await?;
    rpc(&context, 3, "ledger/undo", json!({})).await?;
    info!(a1 = ?grid.value(DEFAULT_SHEET, "A1"), "after undo");
    rpc(&context, 4, "ledger/redo", json!({})).await?;
    info!(a1 = ?grid.value(DEFAULT_SHEET, "A1"), "after redo");

    let batch = rpc(&context, 5, "ledger/startBatch", json!({ "description": "fill row" })).await?;
    for (id, target) in [(6, "A2"), (7, "B2"), (8, "C2")] {
        write(&context, id, target, json!(id * 10)).await?;
    }
    rpc(&context, 9, "ledger/endBatch", json!({})).await?;
    let report = rpc(&context, 10, "ledger/undoBatch", json!({ "batchId": batch["batchId"] })).await?;
    info!(undone = %report["undone"], "batch undone");

    match rpc(
        &context,
        11,
        "tools/call",
        json!({ "name": "excel/clear-range", "arguments": { "target": "A1" } }),
    )
    .await
    {
        Ok(_) => info!(a1 = ?grid.value(DEFAULT_SHEET, "A1"), "gated clear executed"),
        Err(error) => warn!(error = format!("{error:#}"), "gated clear not executed"),
    }

    let history = rpc(&context, 12, "ledger/history", json!({ "limit": 20 })).await?;
    info!(history = %serde_json::to_string_pretty(&history)?, "ledger history");

    kernel.flush().await;
    Ok(())
}
