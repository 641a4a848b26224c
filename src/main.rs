//! # agent-sync
//!
//! Entry point for the Upbound agent controller.
//!
//! ## Initialization Sequence
//!
//! 1. **Configuration** - Load the config file, apply CLI overrides, validate
//! 2. **Kubernetes Client** - Kubeconfig or in-cluster service account
//! 3. **Reconciler** - Agent reconciler over the API server store
//! 4. **Reconciliation Loop** - Fed by Secret and Deployment watches
//!
//! Any failure during initialization halts startup with a clear error message.
//!
//! ## Shutdown
//!
//! SIGINT or SIGTERM stops the loop after the in-flight reconcile finishes.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use agent_sync::cli::{Cli, LogFormat};
use agent_sync_core::AgentConfig;
use agent_sync_reconciler::{
    AgentReconciler, KubeObjectStore, LoopConfig, ObjectStore, ReconcilerBuilder,
    ReconciliationLoop, TracingObjectStore, kube_watch,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.debug, cli.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "agent-sync starting...");

    let config = load_config(&cli)?;
    info!(
        token_secret = %config.token_secret_name,
        reconcile_timeout_secs = config.reconcile_timeout_seconds,
        "Configuration loaded"
    );

    let client = Client::try_default().await.context(
        "Failed to create Kubernetes client. Please check your kubeconfig or in-cluster service account",
    )?;

    let reconciler = init_reconciler(client.clone(), config)?;
    info!("Reconciler initialized");

    let mut loop_runner = ReconciliationLoop::new(reconciler.clone(), LoopConfig::default());
    let stopper = loop_runner.stopper();
    tokio::spawn(async move {
        if wait_for_shutdown().await {
            stopper.stop();
        }
    });

    let notifications =
        kube_watch::notifications(client, cli.namespace.as_deref(), &reconciler.predicate());

    info!(
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        "agent-sync is running. Press Ctrl+C to stop."
    );
    loop_runner
        .run(notifications)
        .await
        .context("Reconciliation loop failed")?;

    info!("agent-sync stopped gracefully");
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
///
/// `RUST_LOG` wins over `--debug` when set.
fn init_tracing(debug: bool, format: LogFormat) {
    let default_level = if debug { "debug" } else { "info" };
    let registry = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
    );

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Load the configuration file and apply CLI overrides.
fn load_config(cli: &Cli) -> Result<AgentConfig> {
    AgentConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?
        .with_token_secret_name(cli.token_secret.clone())
        .with_reconcile_timeout_seconds(cli.reconcile_timeout)
        .into_validated()
        .context("Invalid configuration")
}

/// Build the reconciler on top of the API server.
fn init_reconciler(client: Client, config: AgentConfig) -> Result<Arc<AgentReconciler>> {
    let timeout = config.reconcile_timeout();
    let store: Arc<dyn ObjectStore> =
        Arc::new(TracingObjectStore::new(KubeObjectStore::new(client)));

    let reconciler = ReconcilerBuilder::new()
        .with_store(store)
        .token_secret_name(config.token_secret_name)
        .deployment_spec(config.deployment)
        .reconcile_timeout(timeout)
        .build()
        .context("Failed to build reconciler")?;

    Ok(Arc::new(reconciler))
}

/// Wait for Ctrl+C or SIGTERM. Returns false if Ctrl+C cannot be listened
/// for, in which case the controller keeps running.
async fn wait_for_shutdown() -> bool {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => {
                info!("Received Ctrl+C, initiating graceful shutdown");
                true
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
                false
            }
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
            true
        }
    }
}
