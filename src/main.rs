//! Steward - self-managing cluster operator

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steward::config::StewardConfig;
use steward::gateway::Gateway;
use steward::poller::Poller;
use steward::reconciler::Reconciler;
use steward::suspension::Suspensions;
use steward::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Steward - keeps a running cluster consistent with its operational invariants
#[derive(Parser, Debug)]
#[command(name = "steward", version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short = 'c', long = "config", env = "STEWARD_CONFIG", global = true)]
    config_file: Option<PathBuf>,

    /// Log line format
    #[arg(long, env = "STEWARD_LOG_FORMAT", value_enum, default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcile loop (default mode)
    Run(Overrides),

    /// Load and validate the configuration, then exit
    CheckConfig(Overrides),
}

/// Settings that override the configuration file
#[derive(Parser, Debug, Default)]
struct Overrides {
    /// Namespace for task markers and host task pods
    #[arg(long, env = "STEWARD_NAMESPACE")]
    namespace: Option<String>,

    /// Image used for host task pods
    #[arg(long, env = "STEWARD_HOST_TASK_IMAGE")]
    host_task_image: Option<String>,

    /// Purge nodes unreachable for longer than the toleration
    #[arg(long, env = "STEWARD_PURGE_DEAD_NODES")]
    purge_dead_nodes: Option<bool>,

    /// Force-delete stuck pods on dead nodes
    #[arg(long, env = "STEWARD_CLEAR_DEAD_NODES")]
    clear_dead_nodes: Option<bool>,

    /// Manage Rook storage membership and replication
    #[arg(long, env = "STEWARD_MAINTAIN_STORAGE")]
    maintain_storage: Option<bool>,

    /// Keep the internal load balancer in sync
    #[arg(long, env = "STEWARD_INTERNAL_LOAD_BALANCER")]
    internal_load_balancer: Option<bool>,

    /// Approve kubelet serving CSRs
    #[arg(long, env = "STEWARD_APPROVE_KUBELET_CSRS")]
    approve_kubelet_csrs: Option<bool>,

    /// Time between reconcile ticks (e.g. "1m", "30s")
    #[arg(long, env = "STEWARD_RECONCILE_INTERVAL", value_parser = humantime_serde::re::humantime::parse_duration)]
    reconcile_interval: Option<Duration>,
}

impl Overrides {
    fn apply(self, config: &mut StewardConfig) {
        if let Some(v) = self.namespace {
            config.namespace = v;
        }
        if let Some(v) = self.host_task_image {
            config.host_task_image = v;
        }
        if let Some(v) = self.purge_dead_nodes {
            config.purge_dead_nodes = v;
        }
        if let Some(v) = self.clear_dead_nodes {
            config.clear_dead_nodes = v;
        }
        if let Some(v) = self.maintain_storage {
            config.maintain_storage = v;
        }
        if let Some(v) = self.internal_load_balancer {
            config.internal_load_balancer = v;
        }
        if let Some(v) = self.approve_kubelet_csrs {
            config.approve_kubelet_csrs = v;
        }
        if let Some(v) = self.reconcile_interval {
            config.reconcile_interval = v;
        }
    }
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> anyhow::Result<StewardConfig> {
    let mut config = match path {
        Some(path) => StewardConfig::from_file(path)?,
        None => StewardConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client needs a process-wide rustls provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::CheckConfig(overrides)) => {
            let config = load_config(cli.config_file.as_ref(), overrides)?;
            info!(?config, "configuration is valid");
            Ok(())
        }
        Some(Commands::Run(overrides)) => {
            run(load_config(cli.config_file.as_ref(), overrides)?).await
        }
        None => run(load_config(cli.config_file.as_ref(), Overrides::default())?).await,
    }
}

/// Run the poller until ctrl-c or SIGTERM
async fn run(config: StewardConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let gateway = Gateway::from_client(client, &config);
    let suspensions = Arc::new(Suspensions::new());
    let reconciler = Arc::new(
        Reconciler::builder(gateway.clone(), config.clone())
            .suspensions(suspensions)
            .build(),
    );
    let poller = Poller::new(gateway.nodes.clone(), reconciler, &config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    info!(
        namespace = %config.namespace,
        purge = config.purge_dead_nodes,
        storage = config.maintain_storage,
        internal_lb = config.internal_load_balancer,
        "steward starting"
    );
    poller.run(cancel).await;
    info!("steward stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}
