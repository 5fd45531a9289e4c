//! Compute-to-data - running algorithms next to the data in docker clusters
//!
//! Handles:
//! - Job model, statuses and the pure transition rules
//! - Per-job working folders and the persistent job store
//! - One polling engine per configured cluster, plus a free-tier engine
//! - Routing job operations to the engine that owns the job

pub mod engine;
pub mod folders;
pub mod free;
pub mod jobstore;
pub mod models;
pub mod runtime;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::ComputeConfig;
use crate::ddo::DdoLookup;
use crate::error::{NodeError, NodeResult};
use crate::storage::StorageClient;

pub use engine::{ComputeEngine, EngineSettings, ResultStream, StartJob};
pub use jobstore::JobStore;
pub use models::{ComputeEnvironment, ComputeJob, ComputeJobStatus};
pub use runtime::{ContainerRuntime, DockerCli};

/// Every engine this node runs, sharing one job store.
#[derive(Clone)]
pub struct ComputeEngines {
    engines: Vec<ComputeEngine>,
    jobs: Arc<JobStore>,
}

impl ComputeEngines {
    pub fn new(engines: Vec<ComputeEngine>, jobs: Arc<JobStore>) -> Self {
        Self { engines, jobs }
    }

    /// Engines for every configured cluster, each backed by its docker CLI.
    pub fn from_config(
        config: &ComputeConfig,
        data_dir: &Path,
        storage: StorageClient,
        ddos: Option<Arc<dyn DdoLookup>>,
    ) -> anyhow::Result<Self> {
        let jobs = Arc::new(JobStore::open(data_dir)?);
        let mut engines = Vec::new();
        for cluster in &config.clusters {
            let runtime: Arc<dyn ContainerRuntime> =
                Arc::new(DockerCli::new(cluster.docker_bin.clone(), cluster.docker_host.clone()));
            let settings = EngineSettings::from_cluster(cluster)?;
            engines.push(ComputeEngine::new(
                settings,
                runtime.clone(),
                jobs.clone(),
                storage.clone(),
                ddos.clone(),
            )?);
            if let Some(settings) = free::free_settings(cluster)? {
                engines.push(ComputeEngine::new(
                    settings,
                    runtime,
                    jobs.clone(),
                    storage.clone(),
                    ddos.clone(),
                )?);
            }
        }
        info!(engines = engines.len(), "Compute engines configured");
        Ok(Self::new(engines, jobs))
    }

    /// Pick up jobs that were running when the node last stopped.
    pub fn resume(&self) -> NodeResult<()> {
        for engine in &self.engines {
            engine.resume()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn by_hash(&self, cluster_hash: &str) -> Option<&ComputeEngine> {
        self.engines.iter().find(|e| e.cluster_hash() == cluster_hash)
    }

    pub fn free(&self) -> Option<&ComputeEngine> {
        self.engines.iter().find(|e| e.is_free())
    }

    /// Engine owning `environment_id`.
    pub fn for_environment(&self, environment_id: &str) -> Option<&ComputeEngine> {
        self.engines.iter().find(|e| e.has_environment(environment_id))
    }

    /// Engine that runs `job_id`.
    pub fn for_job(&self, job_id: &str) -> NodeResult<&ComputeEngine> {
        let job = self
            .jobs
            .get_job(job_id)?
            .ok_or_else(|| NodeError::NotFound(format!("Cannot find job with id {}", job_id)))?;
        self.by_hash(&job.cluster_hash)
            .ok_or_else(|| NodeError::NotFound(format!("No compute engine for job {}", job_id)))
    }

    pub fn environments(&self) -> NodeResult<Vec<ComputeEnvironment>> {
        let mut all = Vec::new();
        for engine in &self.engines {
            all.extend(engine.environments()?);
        }
        Ok(all)
    }

    /// Job statuses across every engine.
    pub async fn job_status(
        &self,
        owner: Option<&str>,
        agreement_id: Option<&str>,
        job_id: Option<&str>,
    ) -> NodeResult<Vec<ComputeJob>> {
        let mut all = Vec::new();
        for engine in &self.engines {
            all.extend(engine.get_compute_job_status(owner, agreement_id, job_id).await?);
        }
        Ok(all)
    }
}
