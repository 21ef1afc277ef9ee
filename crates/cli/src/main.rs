use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};

use argus_storage::ResourceStorage;
use argus_sync::MultiClusterSynchroManager;

mod config;

use config::{Config, StorageConfig};

#[derive(Parser, Debug)]
#[command(name = "argusd", version, about = "Argus multi-cluster resource sync")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync engine against the configured clusters
    Run {
        /// Path to the config file (storage, clusters, rules)
        #[arg(short = 'c', long = "config")]
        config: String,
    },
    /// Parse and validate a config file without connecting anywhere
    Validate {
        /// Path to the config file
        config: String,
    },
}

fn init_tracing() {
    let env = std::env::var("ARGUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARGUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARGUS_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_storage(cfg: &StorageConfig) -> Result<Arc<dyn ResourceStorage>> {
    match cfg {
        StorageConfig::Memory => Ok(Arc::new(argus_storage::MemoryStorage::new())),
        StorageConfig::Sqlite { path } => Ok(Arc::new(argus_storage::SqliteStorage::open(path)?)),
    }
}

async fn run(config_path: &str) -> Result<()> {
    let cfg = Config::load(config_path)?;
    cfg.validate()?;

    let storage = open_storage(&cfg.storage)?;
    let manager = MultiClusterSynchroManager::new(storage);

    for cluster in &cfg.clusters {
        info!(cluster = %cluster.name, "connecting");
        let client = match argus_kubehub::connect(cluster).await {
            Ok(client) => client,
            Err(e) => {
                // One unreachable cluster must not stop the others.
                error!(cluster = %cluster.name, error = %e, "connect failed; skipping cluster");
                continue;
            }
        };
        let factory = Arc::new(argus_kubehub::KubeListWatchFactory::new(&cluster.name, client));
        let synchro = manager.create(&cluster.name, factory);
        if let Err(e) = synchro.set_sync_rules(cfg.rules.clone()) {
            error!(cluster = %cluster.name, error = %e, "rejected sync rules");
        }
    }
    info!(clusters = manager.cluster_names().len(), rules = cfg.rules.len(), "engine running");

    signal::ctrl_c().await?;
    warn!("shutdown signal received; draining");
    manager.stop_all().await;
    info!("all clusters stopped");
    Ok(())
}

fn validate(config_path: &str, output: Output) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let result = cfg.validate();
    match output {
        Output::Human => match &result {
            Ok(()) => println!(
                "ok: {} cluster(s), {} rule(s)",
                cfg.clusters.len(),
                cfg.rules.len()
            ),
            Err(e) => println!("invalid: {e:#}"),
        },
        Output::Json => {
            let summary = serde_json::json!({
                "valid": result.is_ok(),
                "error": result.as_ref().err().map(|e| format!("{e:#}")),
                "clusters": cfg.clusters.len(),
                "rules": cfg.rules.len(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Validate { config } => validate(&config, cli.output),
    }
}
