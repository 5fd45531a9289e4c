//! In-process fakes for the network, chain and container runtime
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use datanode::compute::engine::{ComputeEngine, EngineSettings};
use datanode::compute::free::free_settings;
use datanode::compute::runtime::{ContainerOptions, ContainerRuntime, ContainerState};
use datanode::compute::{ComputeEngines, JobStore};
use datanode::config::{Config, DockerClusterConfig, FreeEnvironmentConfig, StorageConfig};
use datanode::context::NodeContext;
use datanode::ddo::legitimacy::{ReceiptLog, TransactionReceipt, METADATA_CREATED_TOPIC};
use datanode::ddo::{Blockchain, DdoResolver, LegitimacyChecker, ResolverSettings, SqliteDocumentStore};
use datanode::dispatcher::CommandResponse;
use datanode::error::{NodeError, NodeResult};
use datanode::nonce::NonceStore;
use datanode::p2p::protocols::CommandStatus;
use datanode::p2p::{ContentRouter, PeerTransport};
use datanode::storage::StorageClient;
use datanode::stream::{self, ByteStream};

pub const NFT: &str = "0x181e8a7f8767808bea51F61044E27C5F8bf7C939";
pub const CHAIN: u64 = 8996;
pub const DID: &str = "did:op:12b17ee47536dc342f67a5fab2f014ddeb10be04018bc6bc53953655e2f7f8ff";
pub const LOCAL_PEER: &str = "12D3KooWLocal";
pub const LOCAL_PUBLIC_KEY: &str = "08011220a1b2c3";

/// A DDO that passes every legitimacy check against [`FakeChain`].
pub fn ddo(updated: &str, block: i64) -> Value {
    json!({
        "@context": ["https://w3id.org/did/v1"],
        "id": DID,
        "version": "4.1.0",
        "nftAddress": NFT,
        "chainId": CHAIN,
        "metadata": {"updated": updated, "type": "dataset", "name": "weather"},
        "services": [{"id": "svc-1", "type": "compute", "files": "0xenc", "extra": 1}],
        "indexedMetadata": {"event": {"tx": "0xfeed", "block": block}}
    })
}

//=============================================================================
// NETWORK
//=============================================================================

#[derive(Default)]
pub struct FakeRouter {
    pub providers: Vec<String>,
    pub fail: bool,
    pub advertised: Mutex<Vec<String>>,
    pub lookups: AtomicUsize,
}

impl FakeRouter {
    pub fn with_providers(providers: &[&str]) -> Self {
        Self {
            providers: providers.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentRouter for FakeRouter {
    async fn advertise(&self, id: &str) -> NodeResult<()> {
        self.advertised.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn find_providers(&self, _id: &str, _timeout: Duration) -> NodeResult<Vec<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NodeError::Internal("routing table empty".into()));
        }
        Ok(self.providers.clone())
    }
}

/// Serves `getDDO` from a per-peer document map, optionally after a delay.
#[derive(Default)]
pub struct FakeTransport {
    pub docs: Mutex<HashMap<String, Value>>,
    pub delays: Mutex<HashMap<String, Duration>>,
    pub sent: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn serve(&self, peer: &str, doc: Value) {
        self.docs.lock().unwrap().insert(peer.to_string(), doc);
    }

    pub fn delay(&self, peer: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(peer.to_string(), delay);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn local_peer_id(&self) -> String {
        LOCAL_PEER.to_string()
    }

    fn local_public_key(&self) -> Option<String> {
        Some(LOCAL_PUBLIC_KEY.to_string())
    }

    async fn send_to(&self, peer_id: &str, _payload: Vec<u8>) -> NodeResult<CommandResponse> {
        self.sent.lock().unwrap().push(peer_id.to_string());
        let delay = self.delays.lock().unwrap().get(peer_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let doc = self.docs.lock().unwrap().get(peer_id).cloned();
        Ok(match doc {
            Some(doc) => CommandResponse {
                status: CommandStatus::ok(),
                stream: Some(stream::once(serde_json::to_vec(&doc).unwrap())),
            },
            None => CommandResponse::error(404, "Not found"),
        })
    }

    async fn broadcast(&self, _payload: Vec<u8>) -> NodeResult<()> {
        Ok(())
    }

    async fn topic_peers(&self) -> NodeResult<Vec<String>> {
        Ok(vec![])
    }
}

//=============================================================================
// CHAIN
//=============================================================================

pub struct FakeChain {
    pub height: u64,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self { height: 1_000 }
    }
}

#[async_trait]
impl Blockchain for FakeChain {
    fn supports_chain(&self, chain_id: u64) -> bool {
        chain_id == CHAIN
    }

    async fn nft_deployed_by_factory(&self, _chain_id: u64, _nft_address: &str) -> Result<bool> {
        Ok(true)
    }

    async fn block_number(&self, _chain_id: u64) -> Result<u64> {
        Ok(self.height)
    }

    async fn transaction_receipt(&self, _chain_id: u64, _tx: &str) -> Result<Option<TransactionReceipt>> {
        Ok(Some(TransactionReceipt {
            block_number: Some(10),
            logs: vec![ReceiptLog {
                address: NFT.to_string(),
                topics: vec![METADATA_CREATED_TOPIC.to_string()],
            }],
        }))
    }
}

pub struct Resolution {
    pub resolver: Arc<DdoResolver>,
    pub store: Arc<SqliteDocumentStore>,
    pub router: Arc<FakeRouter>,
    pub transport: Arc<FakeTransport>,
}

pub fn resolver_with(settings: ResolverSettings, router: FakeRouter, chain: FakeChain) -> Resolution {
    let store = Arc::new(SqliteDocumentStore::open_in_memory().unwrap());
    let router = Arc::new(router);
    let transport = Arc::new(FakeTransport::default());
    let resolver = Arc::new(DdoResolver::new(
        settings,
        store.clone(),
        router.clone(),
        transport.clone(),
        LegitimacyChecker::new(Arc::new(chain)),
    ));
    Resolution {
        resolver,
        store,
        router,
        transport,
    }
}

//=============================================================================
// CONTAINERS
//=============================================================================

#[derive(Default)]
pub struct FakeRuntime {
    pub fail_pull: bool,
    pub fail_volume: bool,
    pub fail_create: bool,
    pub fail_upload: bool,
    pub fail_start: bool,
    pub calls: Mutex<Vec<String>>,
    pub containers: Mutex<HashMap<String, bool>>,
    pub options: Mutex<Vec<ContainerOptions>>,
}

impl FakeRuntime {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Make a running container exit on its own.
    pub fn exit(&self, name: &str) {
        self.containers.lock().unwrap().insert(name.to_string(), false);
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.containers.lock().unwrap().get(name).copied().unwrap_or(false)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, image: &str) -> Result<String> {
        self.record(format!("pull {}", image));
        if self.fail_pull {
            bail!("manifest for {} not found", image);
        }
        Ok(format!("Status: Downloaded newer image for {}", image))
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.record(format!("volume {}", name));
        if self.fail_volume {
            bail!("no space left on device");
        }
        Ok(())
    }

    async fn create_container(&self, options: &ContainerOptions) -> Result<()> {
        self.record(format!("create {}", options.name));
        if self.fail_create {
            bail!("invalid reference format");
        }
        self.options.lock().unwrap().push(options.clone());
        self.containers.lock().unwrap().insert(options.name.clone(), false);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.record(format!("start {}", name));
        if self.fail_start {
            bail!("exec format error");
        }
        self.containers.lock().unwrap().insert(name.to_string(), true);
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.record(format!("stop {}", name));
        self.exit(name);
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerState> {
        let running = self
            .containers
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("no such container {}", name))?;
        Ok(ContainerState {
            running,
            exit_code: 0,
            oom_killed: false,
        })
    }

    async fn get_archive(&self, name: &str, path: &str, dest: &Path) -> Result<()> {
        self.record(format!("get_archive {} {}", name, path));
        std::fs::write(dest, b"outputs")?;
        Ok(())
    }

    async fn put_archive(&self, name: &str, path: &str, archive: &Path) -> Result<()> {
        self.record(format!("put_archive {} {}", name, path));
        if self.fail_upload {
            bail!("container {} is not running", name);
        }
        if !archive.exists() {
            bail!("archive {} missing", archive.display());
        }
        Ok(())
    }

    async fn container_logs(&self, name: &str, _follow: bool) -> Result<ByteStream> {
        Ok(stream::once(format!("logs of {}\n", name)))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.record(format!("rm {}", name));
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record(format!("rm_volume {}", name));
        Ok(())
    }
}

pub fn cluster(temp: &Path) -> DockerClusterConfig {
    DockerClusterConfig {
        temp_folder: temp.to_path_buf(),
        // Tests tick by hand
        cron_time_ms: 3_600_000,
        free: Some(FreeEnvironmentConfig::default()),
        ..Default::default()
    }
}

pub fn free_engine(temp: &Path, runtime: Arc<FakeRuntime>, jobs: Arc<JobStore>) -> ComputeEngine {
    let settings: EngineSettings = free_settings(&cluster(temp)).unwrap().unwrap();
    let storage = StorageClient::new(&StorageConfig::default()).unwrap();
    ComputeEngine::new(settings, runtime, jobs, storage, None).unwrap()
}

/// Tick until `done` holds or the budget runs out, letting background pulls progress.
pub async fn drive<F>(engine: &ComputeEngine, jobs: &JobStore, job_id: &str, max_ticks: usize, done: F)
where
    F: Fn(&datanode::compute::ComputeJob) -> bool,
{
    for _ in 0..max_ticks {
        engine.tick().await;
        let job = jobs.get_job(job_id).unwrap().unwrap();
        if done(&job) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let job = jobs.get_job(job_id).unwrap().unwrap();
    panic!("job {} stuck in {:?}", job_id, job.status);
}

pub struct TestNode {
    pub ctx: Arc<NodeContext>,
    pub resolution: Resolution,
    pub runtime: Arc<FakeRuntime>,
    pub jobs: Arc<JobStore>,
    pub engine: ComputeEngine,
}

pub fn test_node(temp: &Path, config: Config) -> TestNode {
    let resolution = resolver_with(ResolverSettings::default(), FakeRouter::default(), FakeChain::default());
    let runtime = Arc::new(FakeRuntime::default());
    let jobs = Arc::new(JobStore::open_in_memory().unwrap());
    let engine = free_engine(temp, runtime.clone(), jobs.clone());
    let ctx = Arc::new(NodeContext {
        config,
        store: resolution.store.clone(),
        resolver: resolution.resolver.clone(),
        storage: StorageClient::new(&StorageConfig::default()).unwrap(),
        compute: ComputeEngines::new(vec![engine.clone()], jobs.clone()),
        transport: resolution.transport.clone(),
        router: resolution.router.clone(),
        nonces: Arc::new(NonceStore::open_in_memory().unwrap()),
        started_at: Instant::now(),
    });
    TestNode {
        ctx,
        resolution,
        runtime,
        jobs,
        engine,
    }
}
