use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use magsag_kernel::{ClientKey, GatewayBuilder, GatewayConfig, ToolRequest};
use magsag_protocol::{
    GateError, GateEventKind, Permission, PolicyDocument, PolicyRule, ResolutionAction, RunId,
};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "magsagd")]
#[command(about = "MAGSAG gate demo daemon")]
struct Cli {
    /// Gateway configuration (JSON). Built-in demo policy when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Append every gate event to this JSONL file.
    #[arg(long)]
    journal: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
    /// Name recorded as the resolver of demo approvals.
    #[arg(long, default_value = "operator")]
    owner: String,
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).compact().init();
    }
}

fn demo_config() -> GatewayConfig {
    GatewayConfig {
        policy: PolicyDocument::new(Permission::RequireApproval)
            .rule(PolicyRule::new("read_*", Permission::Always))
            .rule(PolicyRule::new("drop_*", Permission::Never)),
        ..GatewayConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => demo_config(),
    };
    if let Some(journal) = cli.journal {
        config.journal_path = Some(journal);
    }

    let gateway = GatewayBuilder::from_config(config)
        .build()
        .await
        .context("failed to build gateway")?;
    let sweeper = gateway.spawn_sweeper(gateway.sweep_interval());

    let mut events = gateway.subscribe();
    let reviewer = {
        let gateway = gateway.clone();
        let owner = cli.owner.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let rendered = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned());
                info!(event = event.name(), payload = %rendered, "gate event");
                if let GateEventKind::ApprovalRequired { ticket } = event.kind {
                    if let Err(error) = gateway
                        .resolve_ticket(
                            &ticket.ticket_id,
                            ResolutionAction::Approve,
                            owner.clone(),
                            Some("approved by demo reviewer".to_owned()),
                        )
                        .await
                    {
                        warn!(%error, "demo reviewer could not resolve ticket");
                    }
                }
            }
        })
    };

    let client = ClientKey::from_parts(Some("demo"), None);
    let run_id = RunId::new_uuid();

    let read = gateway
        .execute(
            &client,
            ToolRequest::new(
                run_id.clone(),
                "demo-agent",
                "read_file",
                json!({"path": "README.md"}),
            ),
            None,
            |args| async move { Ok::<_, GateError>(format!("read {}", args["path"])) },
        )
        .await;
    info!(outcome = ?read, "read_file finished");

    let write = gateway
        .execute(
            &client,
            ToolRequest::new(
                run_id.clone(),
                "demo-agent",
                "write_file",
                json!({"path": "notes.txt", "content": "hello"}),
            ),
            Some(Duration::from_secs(10)),
            |args| async move { Ok::<_, GateError>(format!("wrote {}", args["path"])) },
        )
        .await;
    info!(outcome = ?write, "write_file finished");

    let forbidden = gateway
        .execute(
            &client,
            ToolRequest::new(run_id, "demo-agent", "drop_table", json!({"table": "users"})),
            None,
            |_| async { Ok::<_, GateError>("dropped".to_owned()) },
        )
        .await;
    match &forbidden {
        Err(error) => info!(kind = error.kind(), %error, "drop_table refused"),
        Ok(_) => warn!("drop_table ran; check the configured policy"),
    }

    sweeper.abort();
    reviewer.abort();
    Ok(())
}
