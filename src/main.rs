//! datanode daemon
//!
//! Starts the libp2p swarm, the DDO resolver, the compute engines of every
//! configured docker cluster and the coordinator that ties them together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use datanode::compute::ComputeEngines;
use datanode::config::Config;
use datanode::context::NodeContext;
use datanode::ddo::{DdoLookup, DdoResolver, JsonRpcBlockchain, LegitimacyChecker, ResolverSettings, SqliteDocumentStore};
use datanode::dispatcher::Dispatcher;
use datanode::nonce::NonceStore;
use datanode::p2p::{self, Coordinator, P2pHandle};
use datanode::storage::StorageClient;

#[derive(Parser)]
#[command(name = "datanode")]
#[command(about = "Data-publishing network node: DDO resolution and compute-to-data")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "DATANODE_CONFIG", default_value = "datanode.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "DATANODE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Default log level for this crate
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("datanode={}", cli.log_level).parse()?),
        )
        .init();

    info!("Starting datanode");
    info!("Config file: {}", cli.config.display());

    let mut config = Config::load(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    let data_dir = config.node.data_dir.clone();
    info!("Data dir: {}", data_dir.display());

    // --- P2P layer ---
    let swarm = p2p::build_swarm(&config.p2p, &data_dir)?;
    let local_peer_id = *swarm.local_peer_id();
    let public_key = swarm.public_key_hex();
    info!(peer_id = %local_peer_id, "P2P swarm built");

    let (event_tx, event_rx) = mpsc::channel(256);
    let (command_tx, command_rx) = mpsc::channel(256);
    let handle = P2pHandle::new(
        local_peer_id,
        command_tx.clone(),
        Duration::from_secs(config.p2p.dial_timeout_secs + config.p2p.request_timeout_secs),
    )
    .with_public_key(public_key);
    let network = Arc::new(handle.clone());

    // --- DDO layer ---
    let store = Arc::new(SqliteDocumentStore::open(&data_dir)?);
    let nonces = Arc::new(NonceStore::open(&data_dir)?);
    let chain = Arc::new(JsonRpcBlockchain::new(&config.chains)?);
    let resolver = Arc::new(DdoResolver::new(
        ResolverSettings::from_config(&config),
        store.clone(),
        network.clone(),
        network.clone(),
        LegitimacyChecker::new(chain),
    ));

    // --- Storage and compute ---
    let storage = StorageClient::new(&config.storage)?;
    let lookup: Arc<dyn DdoLookup> = resolver.clone();
    let compute = ComputeEngines::from_config(&config.compute, &data_dir, storage.clone(), Some(lookup))?;
    if compute.is_empty() {
        info!("No compute clusters configured");
    }
    compute.resume()?;

    let ctx = Arc::new(NodeContext {
        config: config.clone(),
        store,
        resolver,
        storage,
        compute,
        transport: network.clone(),
        router: network,
        nonces,
        started_at: Instant::now(),
    });
    let dispatcher = Arc::new(Dispatcher::new(ctx));

    tokio::spawn(swarm.run(event_tx, command_rx));
    let coordinator = Coordinator::new(&config, dispatcher, handle, command_tx);

    tokio::select! {
        _ = coordinator.run(event_rx) => {
            error!("Coordinator stopped");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
    }

    Ok(())
}
