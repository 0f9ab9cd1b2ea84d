//! hostgridd — the per-host instance agent.
//!
//! Assembles the agent's collaborators, rebuilds state from the supervisor,
//! then serves the scheduler API while the groomer reconciles in the
//! background.
//!
//! # Usage
//!
//! ```text
//! hostgridd run --config /etc/hostgrid/agent.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hostgrid_cluster::{HttpCoordinationClient, HttpRoutingClient};
use hostgrid_core::AgentConfig;
use hostgrid_instance::{
    Collaborators, Groomer, InMemoryVersionRegistry, InstanceOrchestrator, SystemProcesses,
};
use hostgrid_source::ArchiveSourceProvider;
use hostgrid_supervisor::MonitSupervisor;
use hostgridd::{ApiState, build_router};

const DEFAULT_FILTER: &str = "info,hostgridd=debug,hostgrid=debug";

#[derive(Parser)]
#[command(name = "hostgridd", about = "hostgrid per-host instance agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover state and serve the agent API.
    Run {
        /// Agent configuration file. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_format } => {
            let config = match config {
                Some(path) => AgentConfig::from_file(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?,
                None => AgentConfig::default(),
            };
            init_tracing(log_format);
            run(config).await
        }
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    info!(private_ip = %config.agent.private_ip, "hostgrid agent starting");

    // ── Collaborators ──────────────────────────────────────────

    let supervisor = Arc::new(MonitSupervisor::new(
        &config.supervisor,
        &config.paths.supervisor_config_dir,
    )?);
    let timeout = config.control_plane.request_timeout;
    let coordination = Arc::new(HttpCoordinationClient::new(
        &config.control_plane.coordination_url,
        timeout,
    )?);
    let routing = Arc::new(HttpRoutingClient::new(
        &config.control_plane.routing_url,
        &config.agent.private_ip,
        timeout,
    )?);
    let sources = Arc::new(ArchiveSourceProvider::new(
        &config.runtimes.unpack_root,
        &config.paths.archive_dir,
        timeout,
    )?);
    let registry = Arc::new(InMemoryVersionRegistry::new());
    let host = Arc::new(SystemProcesses::new());

    let orchestrator = InstanceOrchestrator::new(
        &config,
        Collaborators {
            supervisor,
            coordination,
            routing,
            sources,
            registry: registry.clone(),
            host,
        },
    );

    // ── Recovery ───────────────────────────────────────────────

    let recovered = orchestrator
        .recover_state()
        .await
        .context("recovering instance state")?;
    info!(instances = recovered.len(), "state recovered");

    // ── Groomer ────────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let groomer = Groomer::new(orchestrator.clone(), config.groomer.interval);
    let groomer_handle = tokio::spawn(groomer.run(shutdown_rx));

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState {
        orchestrator,
        registry,
    });
    let listener = tokio::net::TcpListener::bind(&config.agent.listen)
        .await
        .with_context(|| format!("binding {}", config.agent.listen))?;
    info!(addr = %config.agent.listen, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = groomer_handle.await;

    info!("hostgrid agent stopped");
    Ok(())
}
