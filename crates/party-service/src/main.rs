use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use party_core::cache::{Cache, KeyEncoding};
use party_core::config::PartyConfig;
use party_core::party_keys::PartyKeys;
use party_core::status_store::StatusStore;
use party_core::timer::AnalysisTimer;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod aes_bridge;
mod http_app;
mod inference;
mod obelisk_client;
mod task_manager;
mod weights;

use crate::aes_bridge::AesBridge;
use crate::http_app::AppState;
use crate::inference::{InferenceRunner, OfflineDistributor};
use crate::obelisk_client::ObeliskClient;
use crate::task_manager::TaskManager;

#[derive(Parser, Debug)]
#[command(author, version, about = "Compute party inference service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration, load this party's keys, and provision on-disk state.
    Init {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the service: HTTP surface, Task Manager worker, all collaborators.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { config } => init_command(config).await,
        Commands::Run { config } => run_command(config).await,
    }
}

async fn init_command(config_path: PathBuf) -> Result<()> {
    let config = PartyConfig::load(&config_path)?;
    let keys = PartyKeys::load(&config).map_err(|e| anyhow!("party key set failed validation: {e}"))?;

    std::fs::create_dir_all(&config.results_dir)?;
    std::fs::create_dir_all(&config.cache_dir)?;
    std::fs::create_dir_all(config.cache_dir.join("cache").join("keys"))?;
    std::fs::create_dir_all(config.cache_dir.join("ct"))?;
    if let Some(parent) = config.status_db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    StatusStore::open(&config.status_db_path).await?;

    info!(party_index = keys.party_index, "party initialized");
    println!("Party {} initialized at {}", keys.party_index, config.results_dir.display());
    Ok(())
}

async fn run_command(config_path: PathBuf) -> Result<()> {
    let config = PartyConfig::load(&config_path)?;
    let keys = Arc::new(PartyKeys::load(&config).map_err(|e| anyhow!("party key set failed validation: {e}"))?);

    let http = reqwest::Client::builder().build()?;
    let obelisk = Arc::new(
        ObeliskClient::connect(http, config.obelisk_base_url.clone(), config.server_id.clone(), config.server_secret.clone())
            .await
            .map_err(|e| anyhow!("connecting to obelisk: {}", e.message))?,
    );

    let timeout = Duration::from_secs(config.subprocess_timeout_secs);
    let aes_bridge = Arc::new(AesBridge::new(
        config.aes_bridge_binary.display().to_string(),
        config.aes_bridge_config.display().to_string(),
        timeout,
    ));
    let inference = Arc::new(InferenceRunner::new(
        config.inference_binary.display().to_string(),
        config.mpc_hosts.clone(),
        config.party_index,
        timeout,
    ));
    let offline = Arc::new(OfflineDistributor::new(config.offline_binary.display().to_string(), timeout));

    let cache = Arc::new(Cache::new(config.cache_dir.clone(), config.max_cache_size, KeyEncoding::Json));
    let status_store = Arc::new(StatusStore::open(&config.status_db_path).await?);
    let timer = Arc::new(AnalysisTimer::new(config.timing_log_path()));

    let task_manager = TaskManager::spawn(
        keys,
        obelisk,
        aes_bridge,
        inference,
        cache,
        status_store.clone(),
        timer.clone(),
        config.shares_path("active"),
        config.models_dir.clone(),
        config.party_index,
    );

    let offline_source = config.shares_path("active").display().to_string();
    let state = Arc::new(AppState {
        task_manager,
        status_store,
        timer,
        offline,
        party_index: config.party_index,
        scp_destinations: config.offline_scp_destinations.clone(),
        offline_source,
    });

    let app = http_app::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, party_index = config.party_index, "party service listening");

    let serve = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "http server exited with error");
        }
    });

    signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight work");
    serve.abort();

    Ok(())
}
