use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

use crate::context::NodeContext;
use crate::dispatcher::{CommandHandler, CommandResponse};
use crate::error::NodeResult;
use crate::p2p::protocols::CommandStatus;
use crate::stream;

/// Node identity, supported chains and host details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCommand {
    /// Reported in place of the local peer id when set
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub version: String,
    pub http: bool,
    pub p2p: bool,
    pub provider: Vec<ChainStatus>,
    pub indexer: Vec<IndexerStatus>,
    pub supported_storage: SupportedStorage,
    /// Seconds since the node started
    pub uptime: u64,
    pub platform: PlatformStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub chain_id: u64,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStatus {
    pub chain_id: u64,
    pub network: Option<String>,
    pub block: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedStorage {
    pub url: bool,
    pub arwave: bool,
    pub ipfs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    pub cpus: usize,
    pub freemem: u64,
    pub totalmem: u64,
    pub loadavg: [f64; 3],
    pub arch: String,
    pub machine: String,
    pub platform: String,
    pub release: String,
    pub os_type: String,
    pub os_version: String,
}

impl PlatformStatus {
    fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let load = System::load_average();
        Self {
            cpus: num_cpus::get(),
            freemem: sys.free_memory(),
            totalmem: sys.total_memory(),
            loadavg: [load.one, load.five, load.fifteen],
            arch: std::env::consts::ARCH.to_string(),
            machine: System::cpu_arch().unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            platform: std::env::consts::OS.to_string(),
            release: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            os_type: System::name().unwrap_or_else(|| "unknown".to_string()),
            os_version: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

pub fn node_status(ctx: &NodeContext, node: Option<String>) -> NodeStatus {
    let config = &ctx.config;
    let provider = config
        .chains
        .iter()
        .map(|c| ChainStatus {
            chain_id: c.chain_id,
            network: c.network.clone(),
        })
        .collect();
    // No chain events are indexed, so the reported block stays at zero
    let indexer = if config.node.has_indexer {
        config
            .chains
            .iter()
            .map(|c| IndexerStatus {
                chain_id: c.chain_id,
                network: c.network.clone(),
                block: "0".to_string(),
            })
            .collect()
    } else {
        Vec::new()
    };

    NodeStatus {
        id: node.filter(|n| !n.is_empty()).unwrap_or_else(|| ctx.local_peer_id()),
        public_key: ctx.transport.local_public_key(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        http: false,
        p2p: true,
        provider,
        indexer,
        supported_storage: SupportedStorage {
            url: true,
            arwave: config.storage.arweave_gateway.is_some(),
            ipfs: config.storage.ipfs_gateway.is_some(),
        },
        uptime: ctx.started_at.elapsed().as_secs(),
        platform: PlatformStatus::collect(),
    }
}

#[async_trait]
impl CommandHandler for StatusCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        CommandResponse::json(&node_status(ctx, self.node))
    }
}

/// Current request nonce of an address, as plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceCommand {
    pub address: String,
}

#[async_trait]
impl CommandHandler for NonceCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        let nonce = ctx.nonces.nonce(&self.address)?;
        debug!(address = %self.address, nonce, "Nonce lookup");
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Ok(CommandResponse {
            status: CommandStatus {
                headers: Some(headers),
                ..CommandStatus::ok()
            },
            stream: Some(stream::once(nonce.to_string())),
        })
    }
}
