//! rollguardd: the rollguard daemon.
//!
//! One binary, four modes:
//! - `serve`: health document, rollback trigger and circuit API
//! - `check`: evaluate the deployment once and print the health document
//! - `rollback`: manual rollback of one app
//! - `guard`: watch a fresh deployment and roll it back if it stays unhealthy
//!
//! # Usage
//!
//! ```text
//! rollguardd --config /etc/rollguard.toml serve
//! rollguardd check
//! rollguardd rollback --app shop --reason "bad deploy"
//! rollguardd guard --app shop
//! ```

mod services;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rollguard_core::RollguardConfig;
use rollguard_health::{HealthAggregator, HealthDocument};
use rollguard_rollback::{DeploymentGuard, GuardOutcome, RollbackRequest, RollbackResult};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::services::{Services, open_shared_store, open_store};

const DEFAULT_LOG_FILTER: &str = "info,rollguardd=debug,rollguard=debug";
const PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "rollguardd", about = "Deployment health guard and rollback daemon", version)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "rollguard.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the health document and rollback API.
    Serve {
        /// Listen address; overrides `[server] listen`.
        #[arg(long)]
        listen: Option<String>,
    },

    /// Evaluate deployment health once and print the document.
    Check,

    /// Roll an app back to its previous (or a given) release.
    Rollback {
        #[arg(long)]
        app: String,

        /// Release to roll back to; defaults to the previous one.
        #[arg(long)]
        release: Option<String>,

        #[arg(long)]
        reason: Option<String>,

        #[arg(long, default_value = "cli")]
        initiated_by: String,
    },

    /// Watch a fresh deployment; roll back if it stays unhealthy.
    Guard {
        #[arg(long)]
        app: String,

        #[arg(long, default_value = "rollguard")]
        initiated_by: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Serve { listen } => run_serve(config, listen).await,
        Command::Check => run_check(config).await,
        Command::Rollback {
            app,
            release,
            reason,
            initiated_by,
        } => {
            let mut request = RollbackRequest::manual(&app, &initiated_by);
            if let Some(release) = &release {
                request = request.with_target(release);
            }
            if let Some(reason) = &reason {
                request = request.with_reason(reason);
            }
            run_rollback(config, request).await
        }
        Command::Guard { app, initiated_by } => run_guard(config, &app, &initiated_by).await,
    }
}

/// Logs go to stderr; stdout carries the JSON documents.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// A missing default file means "all defaults"; an explicit path must exist.
fn load_config(path: &Path) -> anyhow::Result<RollguardConfig> {
    if !path.exists() && path == Path::new("rollguard.toml") {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(RollguardConfig::default());
    }
    let config = RollguardConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), probes = config.probes.len(), "configuration loaded");
    Ok(config)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── serve ──────────────────────────────────────────────────────

async fn run_serve(config: RollguardConfig, listen: Option<String>) -> anyhow::Result<ExitCode> {
    info!("rollguard daemon starting");

    let store = Arc::new(open_store(&config.server.data_dir())?);
    let addr = listen.unwrap_or_else(|| config.server.listen().to_string());
    let services = Services::assemble(config, store.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let purge_handle = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.purge_expired() {
                            warn!(error = %e, "purging expired entries failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    // ── API server ─────────────────────────────────────────────

    let router = rollguard_api::build_router(services.app_state(shutdown_rx));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server listening");

    // Graceful shutdown on Ctrl-C; in-flight rollbacks see the same signal.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = purge_handle.await;
    if let Some(orchestrator) = &services.orchestrator {
        orchestrator.flush_notifications().await;
    }

    info!("rollguard daemon stopped");
    Ok(ExitCode::SUCCESS)
}

// ── check ──────────────────────────────────────────────────────

async fn run_check(config: RollguardConfig) -> anyhow::Result<ExitCode> {
    let store = open_shared_store(&config.server.data_dir());
    let services = Services::assemble(config, store);

    let report = HealthAggregator::new()
        .evaluate(&services.factory.deployment_health())
        .await;
    print_json(&HealthDocument::from(&report))?;
    Ok(exit_code(report.overall_status.is_serving()))
}

// ── rollback ───────────────────────────────────────────────────

/// Cancellation signal for one-shot commands, flipped by Ctrl-C.
fn ctrl_c_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cutting verification short");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_rollback(config: RollguardConfig, request: RollbackRequest) -> anyhow::Result<ExitCode> {
    let store = open_shared_store(&config.server.data_dir());
    let services = Services::assemble(config, store);
    let orchestrator = services.orchestrator()?;

    let result = match orchestrator.rollback(request.clone(), ctrl_c_cancel()).await {
        Ok(result) => result,
        Err(e) => {
            error!(app_id = %request.app_id, error = %e, "rollback aborted");
            RollbackResult::failed(&request, &e)
        }
    };
    orchestrator.flush_notifications().await;

    print_json(&result)?;
    Ok(exit_code(result.success))
}

// ── guard ──────────────────────────────────────────────────────

async fn run_guard(config: RollguardConfig, app_id: &str, initiated_by: &str) -> anyhow::Result<ExitCode> {
    let guard_config = config.guard.clone();
    let store = open_shared_store(&config.server.data_dir());
    let services = Services::assemble(config, store);
    let orchestrator = services.orchestrator()?;

    let guard = DeploymentGuard::new(
        services.factory.deployment_health(),
        Arc::clone(&orchestrator),
        guard_config,
    );
    let outcome = guard.watch(app_id, initiated_by, ctrl_c_cancel()).await;
    orchestrator.flush_notifications().await;

    match outcome {
        Ok(GuardOutcome::Stable(report)) => {
            print_json(&HealthDocument::from(&report))?;
            Ok(exit_code(report.overall_status.is_serving()))
        }
        Ok(GuardOutcome::RolledBack(result)) => {
            print_json(&result)?;
            Ok(exit_code(result.success))
        }
        Ok(GuardOutcome::Cancelled) => {
            warn!(%app_id, "guard cancelled before a verdict");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!(%app_id, error = %e, "guard rollback aborted");
            Ok(ExitCode::FAILURE)
        }
    }
}
