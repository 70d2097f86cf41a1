//! quota-pilot
//!
//! Keeps a Cloud Code client on a usable (account, model) pair:
//! 1. Loads accounts from the shared opencode account file
//! 2. Probes per-model quota for the active account
//! 3. Suggests a replacement model or rotates the account when quota runs low
//!
//! `serve` runs the HTTP admin surface with a background quota refresh; the
//! other commands run once and print JSON to stdout.

mod admin;
mod config;
mod locator;
mod logging;
mod metrics;
mod plugin_impl;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloudcode_auth::{CredentialStore, OAuthClient};
use metrics_exporter_prometheus::PrometheusHandle;
use plugin::{AgentConfig, AgentConfigUpdate, QuotaPlugin, StrategyPatch};
use quota_rotation::{
    AccountRotator, ModelSelector, QuotaCacheWriter, QuotaProbe, QuotaStateTable,
    RotationController, spawn_quota_refresh,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::plugin_impl::RotationPlugin;

/// How long in-flight admin requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Quota-aware account and model rotation for Cloud Code clients
#[derive(Parser, Debug)]
#[command(name = "quota-pilot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file; overrides QUOTA_PILOT_CONFIG
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the admin API with background quota refresh (default)
    Serve,
    /// Fresh quota for one model, or for every model
    Status { model: Option<String> },
    /// Limit check with switch or rotate advice
    Check { model: String },
    /// Cool down the active account and move to the next one
    Rotate {
        /// When the current account's quota resets (RFC 3339)
        #[arg(long, value_name = "TIME")]
        reset_time: Option<String>,
    },
    /// Best model under the configured strategy
    Select,
    /// Find the companion language server process
    Locate,
    /// Model assignment for multi-agent hosts
    Agent {
        #[command(subcommand)]
        action: AgentCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
enum AgentCommand {
    /// Model a named agent should run on
    Model {
        name: String,
        /// Model the agent asks for
        #[arg(long)]
        preferred: Option<String>,
    },
    /// Print a configuration for the default agent set
    Init,
    /// Move every agent in a configuration file onto the best model
    Update {
        file: PathBuf,
        /// Replace the preferred model list first (comma separated)
        #[arg(long, value_delimiter = ',')]
        preferred_models: Option<Vec<String>>,
        /// Write the result back to FILE instead of only printing it
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config_path, explicit) = Config::resolve_path(cli.config.as_deref());
    let from_file = explicit || config_path.exists();
    let config = if from_file {
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::parse("").context("failed to build default configuration")?
    };

    let _log_guard = logging::init(&config.logging)?;
    if from_file {
        info!(path = %config_path.display(), "configuration loaded");
    } else {
        info!("no configuration file, using defaults");
    }

    let command = cli.command.unwrap_or(Command::Serve);

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = (command == Command::Serve).then(metrics::install_recorder);

    let controller = build_controller(&config).await?;
    let plugin = Arc::new(
        RotationPlugin::new(controller.clone())
            .with_default_agent_model(config.agents.default_model.clone()),
    );

    match command {
        Command::Serve => {
            let prometheus = prometheus.context("metrics recorder not installed")?;
            serve(&config, controller, plugin, prometheus).await
        }
        Command::Status { model: Some(model) } => {
            print_json(&plugin.get_quota(Some(&model)).await?)
        }
        Command::Status { model: None } => {
            let snapshot = controller.get_all_quotas().await?;
            print_json(&snapshot.models())
        }
        Command::Check { model } => print_json(&plugin.check_model(&model).await?),
        Command::Rotate { reset_time } => {
            print_json(&plugin.rotate_account(reset_time.as_deref()).await?)
        }
        Command::Select => {
            print_json(&serde_json::json!({ "model": plugin.select_best_model().await }))
        }
        Command::Locate => print_json(&locator::find_companion_process().await),
        Command::Agent { action } => run_agent(action, &plugin).await,
    }
}

async fn run_agent(action: AgentCommand, plugin: &RotationPlugin) -> Result<()> {
    match action {
        AgentCommand::Model { name, preferred } => {
            print_json(&plugin.model_for_agent(&name, preferred.as_deref()).await?)
        }
        AgentCommand::Init => print_json(&plugin.default_agent_config()),
        AgentCommand::Update {
            file,
            preferred_models,
            write,
        } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let config: AgentConfig = serde_json::from_str(&contents)
                .with_context(|| format!("{} is not an agent configuration", file.display()))?;

            let updated = plugin
                .update_agent_config(AgentConfigUpdate {
                    config,
                    strategy: StrategyPatch {
                        preferred_models,
                        ..StrategyPatch::default()
                    },
                })
                .await?;

            if write {
                let body = serde_json::to_string_pretty(&updated)?;
                tokio::fs::write(&file, body + "\n")
                    .await
                    .with_context(|| format!("failed to write {}", file.display()))?;
                info!(
                    path = %file.display(),
                    agents = updated.agents.len(),
                    "agent configuration written"
                );
            }
            print_json(&updated)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wire the rotation engine from configuration.
async fn build_controller(config: &Config) -> Result<Arc<RotationController>> {
    let accounts_path = config
        .storage
        .accounts_file
        .clone()
        .or_else(CredentialStore::default_path)
        .context("cannot locate the account file; set storage.accounts_file")?;
    let store = Arc::new(CredentialStore::new(accounts_path));
    let rotator = Arc::new(AccountRotator::load(store, config.rotation.cooldown()).await);

    let table = Arc::new(QuotaStateTable::new(config.rotation.threshold));
    let selector = Arc::new(ModelSelector::new(table.clone(), config.rotation.strategy()));

    if config.oauth.client_secret.is_none() {
        warn!("no OAuth client secret configured, token refresh may be rejected");
    }
    let oauth = OAuthClient {
        client_id: config.oauth.client_id.clone(),
        client_secret: config.oauth.client_secret.clone(),
        token_url: config.oauth.token_url.clone(),
    };
    let probe = QuotaProbe::new(
        reqwest::Client::new(),
        oauth,
        config.probe.base_url.clone(),
        config.probe_timeout(),
    );

    let mut controller = RotationController::new(rotator, table, selector, Arc::new(probe))
        .with_retry_budget(config.rotation.retry_budget);

    if config.storage.write_cache {
        match config
            .storage
            .cache_file
            .clone()
            .or_else(QuotaCacheWriter::default_path)
        {
            Some(path) => controller = controller.with_cache(QuotaCacheWriter::new(path)),
            None => warn!("cannot locate the quota cache file, cache disabled"),
        }
    }

    info!(
        accounts = controller.rotator().len().await,
        threshold = config.rotation.threshold,
        preferred = ?config.rotation.preferred_models,
        "rotation engine ready"
    );
    Ok(Arc::new(controller))
}

async fn serve(
    config: &Config,
    controller: Arc<RotationController>,
    plugin: Arc<RotationPlugin>,
    prometheus: PrometheusHandle,
) -> Result<()> {
    let (refresh_tx, refresh_rx) = tokio::sync::watch::channel(false);
    let refresh = spawn_quota_refresh(
        controller,
        config.daemon.poll_interval(),
        config.daemon.stale_after(),
        refresh_rx,
    );

    let plugin: Arc<dyn QuotaPlugin> = plugin;
    let app = build_admin_router(
        AdminState::new(plugin, prometheus),
        config.daemon.max_connections,
    );

    let listen_addr = config.daemon.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting admin requests");

    // The drain timeout starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    let _ = refresh_tx.send(true);

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, refresh).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "quota refresh task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "quota refresh did not stop in time, abandoning it"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
