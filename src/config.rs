//! Node configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub p2p: P2PConfig,
    #[serde(default)]
    pub ddo: DdoConfig,
    /// Chains this node supports; legitimacy checks reject anything else.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub compute: ComputeConfig,
}

impl Config {
    /// Load config from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory (identity key, databases)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Whether this node keeps a local copy of DDOs it resolves
    #[serde(default = "default_true")]
    pub has_indexer: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            has_indexer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PConfig {
    /// Listen addresses
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Bootstrap nodes for peer discovery
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Enable mDNS discovery on the local network
    #[serde(default = "default_true")]
    pub enable_mdns: bool,

    /// Peer-set poll interval in milliseconds
    #[serde(default = "default_peer_poll_interval")]
    pub peer_poll_interval_ms: u64,

    /// Interval for flushing queued advertisements
    #[serde(default = "default_pending_advertise_interval")]
    pub pending_advertise_interval_secs: u64,

    /// Default timeout for provider lookups
    #[serde(default = "default_find_providers_timeout")]
    pub find_providers_timeout_ms: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Gossip topic every node subscribes to
    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: String,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            bootstrap_nodes: vec![],
            enable_mdns: true,
            peer_poll_interval_ms: default_peer_poll_interval(),
            pending_advertise_interval_secs: default_pending_advertise_interval(),
            find_providers_timeout_ms: default_find_providers_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            request_timeout_secs: default_request_timeout(),
            broadcast_topic: default_broadcast_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdoConfig {
    /// Whole-cache freshness window
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Maximum remote providers queried per resolution
    #[serde(default = "default_max_providers")]
    pub max_providers: usize,

    /// Wait per provider before moving on to the next one
    #[serde(default = "default_per_provider_wait")]
    pub per_provider_wait_secs: u64,

    /// Ceiling for a whole resolution fan-out
    #[serde(default = "default_max_response_wait")]
    pub max_response_wait_secs: u64,

    /// Interval of the republish sweep over locally stored DDOs
    #[serde(default = "default_republish_interval")]
    pub republish_interval_secs: u64,
}

impl Default for DdoConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            max_providers: default_max_providers(),
            per_provider_wait_secs: default_per_provider_wait(),
            max_response_wait_secs: default_max_response_wait(),
            republish_interval_secs: default_republish_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Data NFT factory contract address
    pub nft_factory_address: String,
    /// Human-readable network name reported by `status`
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Peer ids or caller addresses that are refused outright
    #[serde(default)]
    pub deny_list: Vec<String>,

    /// Requests allowed per caller per second (0 disables limiting)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            deny_list: vec![],
            rate_limit_per_second: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub ipfs_gateway: Option<String>,

    #[serde(default)]
    pub arweave_gateway: Option<String>,

    /// Regex patterns of URLs that must never be fetched
    #[serde(default)]
    pub unsafe_urls: Vec<String>,

    #[serde(default = "default_storage_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ipfs_gateway: None,
            arweave_gateway: None,
            unsafe_urls: vec![],
            request_timeout_secs: default_storage_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeConfig {
    #[serde(default)]
    pub clusters: Vec<DockerClusterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerClusterConfig {
    /// Docker CLI binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Optional DOCKER_HOST for this cluster
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Root of the per-job working folders
    #[serde(default = "default_temp_folder")]
    pub temp_folder: PathBuf,

    /// Tick interval of the job loop
    #[serde(default = "default_cron_time")]
    pub cron_time_ms: u64,

    /// How long finished job artifacts are kept
    #[serde(default = "default_storage_expiry")]
    pub storage_expiry_secs: u64,

    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,

    /// Free-tier environment; when present a free engine is started for the cluster
    #[serde(default)]
    pub free: Option<FreeEnvironmentConfig>,
}

impl Default for DockerClusterConfig {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            docker_host: None,
            temp_folder: default_temp_folder(),
            cron_time_ms: default_cron_time(),
            storage_expiry_secs: default_storage_expiry(),
            environments: vec![],
            free: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_one")]
    pub cpu: u32,
    #[serde(default = "default_one")]
    pub ram_gb: u32,
    #[serde(default = "default_disk")]
    pub disk_gb: u32,
    #[serde(default = "default_max_job_duration")]
    pub max_job_duration_secs: u64,
    /// Fee schedule keyed by chain id
    #[serde(default)]
    pub fees: BTreeMap<String, Vec<FeeConfig>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeConfig {
    pub fee_token: String,
    pub price_per_minute: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeEnvironmentConfig {
    #[serde(default = "default_one")]
    pub cpu: u32,
    #[serde(default = "default_one")]
    pub ram_gb: u32,
    #[serde(default = "default_one")]
    pub disk_gb: u32,
    #[serde(default = "default_free_job_duration")]
    pub max_job_duration_secs: u64,
}

impl Default for FreeEnvironmentConfig {
    fn default() -> Self {
        Self {
            cpu: 1,
            ram_gb: 1,
            disk_gb: 1,
            max_job_duration_secs: default_free_job_duration(),
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/datanode") }
fn default_true() -> bool { true }
fn default_listen_addrs() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/9000".to_string(),
        "/ip4/0.0.0.0/udp/9001/quic-v1".to_string(),
    ]
}
fn default_peer_poll_interval() -> u64 { 1000 }
fn default_pending_advertise_interval() -> u64 { 60 }
fn default_find_providers_timeout() -> u64 { 20_000 }
fn default_dial_timeout() -> u64 { 10 }
fn default_request_timeout() -> u64 { 30 }
fn default_broadcast_topic() -> String { "datanode".to_string() }
fn default_cache_ttl() -> u64 { 5 * 60 }
fn default_max_providers() -> usize { 5 }
fn default_per_provider_wait() -> u64 { 5 }
fn default_max_response_wait() -> u64 { 60 }
fn default_republish_interval() -> u64 { 60 * 60 }
fn default_rate_limit() -> u32 { 30 }
fn default_storage_timeout() -> u64 { 30 }
fn default_docker_bin() -> String { "docker".to_string() }
fn default_temp_folder() -> PathBuf { PathBuf::from("/tmp/datanode/c2d") }
fn default_cron_time() -> u64 { 2000 }
fn default_storage_expiry() -> u64 { 60 * 60 * 24 * 7 }
fn default_one() -> u32 { 1 }
fn default_disk() -> u32 { 10 }
fn default_max_job_duration() -> u64 { 60 * 60 }
fn default_free_job_duration() -> u64 { 60 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.ddo.cache_ttl_secs, 300);
        assert_eq!(config.ddo.max_providers, 5);
        assert_eq!(config.p2p.peer_poll_interval_ms, 1000);
        assert!(config.compute.clusters.is_empty());
    }

    #[test]
    fn test_cluster_defaults() {
        let config: Config = toml::from_str(
            r#"
[[compute.clusters]]
temp_folder = "/tmp/jobs"

[compute.clusters.free]
"#,
        )
        .unwrap();
        let cluster = &config.compute.clusters[0];
        assert_eq!(cluster.cron_time_ms, 2000);
        assert_eq!(cluster.docker_bin, "docker");
        assert_eq!(cluster.free.as_ref().unwrap().max_job_duration_secs, 60);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let config = Config::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.p2p.listen_addrs.len(), 2);
    }
}
