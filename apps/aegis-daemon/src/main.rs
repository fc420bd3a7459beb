//! # aegis-daemon
//!
//! Process entry point for the governed execution core. Boots the Sandbox
//! Orchestrator (Egress Proxy, DNS Filter, Audit Log, Approval Queue) in
//! the foreground, handles SIGHUP as a config reload and SIGINT/SIGTERM as
//! an orderly shutdown, and exposes the Approval Queue's human-review
//! surface and the Audit Log's integrity check as subcommands.
//!
//! ## Usage
//!
//! ```text
//! aegis-daemon run --config egress.toml
//! aegis-daemon approvals list --config egress.toml
//! aegis-daemon approvals resolve --config egress.toml <id> --approve
//! aegis-daemon verify-audit --config egress.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aegis_audit::{AuditLog, ChainKey};
use aegis_policy::ApprovalQueue;
use aegis_sandbox::{Orchestrator, ProcessContainerRuntime, SandboxConfig};

#[derive(Parser)]
#[command(name = "aegis-daemon", about = "Governed execution core: sandbox orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the orchestrator and run until SIGINT/SIGTERM. SIGHUP reloads
    /// the egress config without restarting the proxy or DNS filter.
    Run {
        #[arg(long, default_value = "egress.toml")]
        config: PathBuf,
    },
    /// List approval requests awaiting a human decision.
    Approvals {
        #[command(subcommand)]
        action: ApprovalsAction,
    },
    /// Verify the Audit Log's hash chain end to end.
    VerifyAudit {
        #[arg(long, default_value = "egress.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ApprovalsAction {
    List {
        #[arg(long, default_value = "egress.toml")]
        config: PathBuf,
    },
    Resolve {
        #[arg(long, default_value = "egress.toml")]
        config: PathBuf,
        /// The approval request's UUID, as printed by `approvals list`.
        id: uuid::Uuid,
        #[arg(long, conflicts_with = "deny")]
        approve: bool,
        #[arg(long, conflicts_with = "approve")]
        deny: bool,
        #[arg(long)]
        reason: Option<String>,
        /// Identity recorded as the decider in the audit trail.
        #[arg(long, default_value = "operator")]
        decided_by: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("aegis_sandbox=info".parse()?)
                .add_directive("aegis_mediation=info".parse()?)
                .add_directive("aegis_policy=info".parse()?)
                .add_directive("aegis_daemon=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { config } => run(config).await,
        Command::Approvals { action } => approvals(action),
        Command::VerifyAudit { config } => verify_audit(config),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "aegis-daemon exiting with error");
        let exit_code = err
            .downcast_ref::<aegis_sandbox::OrchestratorError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(exit_code);
    }

    Ok(())
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = SandboxConfig::load(&config_path)?;
    let runtime = Arc::new(ProcessContainerRuntime::new(config.container_runtime_binary.clone()));

    tracing::info!(config = %config_path.display(), "booting governed execution core");
    let orchestrator = Orchestrator::boot(config_path, runtime).await?;
    tracing::info!("boot sequence complete; serving until shutdown signal");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    tracing::info!("received SIGHUP, reloading egress config");
                    if let Err(err) = orchestrator.reload().await {
                        tracing::error!(error = %err, "config reload failed; continuing with previous rule set");
                    }
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received ctrl-c, shutting down");
    }

    orchestrator.shutdown().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

fn approvals(action: ApprovalsAction) -> Result<()> {
    match action {
        ApprovalsAction::List { config } => {
            let config = SandboxConfig::load(&config)?;
            let queue = ApprovalQueue::open(config.approval_queue_path())
                .context("failed to open approval queue")?;
            let pending = queue.pending();
            if pending.is_empty() {
                println!("no approval requests pending");
            }
            for request in pending {
                println!(
                    "{}\t{}\t{}",
                    request.id,
                    request.submitted_at.to_rfc3339(),
                    request.prompt
                );
            }
            Ok(())
        }
        ApprovalsAction::Resolve { config, id, approve, deny, reason, decided_by } => {
            if !approve && !deny {
                anyhow::bail!("specify either --approve or --deny");
            }
            let config = SandboxConfig::load(&config)?;
            let queue = ApprovalQueue::open(config.approval_queue_path())
                .context("failed to open approval queue")?;
            if approve {
                queue.resolve_approved(id, decided_by)?;
                println!("approved {id}");
            } else {
                queue.resolve_denied(id, decided_by, reason)?;
                println!("denied {id}");
            }
            Ok(())
        }
    }
}

fn verify_audit(config_path: PathBuf) -> Result<()> {
    let config = SandboxConfig::load(&config_path)?;
    let key = match &config.audit_secret_path {
        Some(path) => ChainKey::load_from_file(path)?,
        None => anyhow::bail!("verify-audit requires audit_secret_path to be set in the egress config"),
    };
    AuditLog::verify_all(&config.audit_log_path, &key)
        .context("audit log hash chain verification failed")?;
    println!("audit log {} verified: chain intact", config.audit_log_path.display());
    Ok(())
}
