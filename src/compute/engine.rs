//! Per-cluster compute engine
//!
//! Jobs are accepted by [`ComputeEngine::start_compute_job`] and then driven
//! by a polling loop: every `cron_time` the engine loads its running jobs,
//! advances each one by a single transition (all jobs concurrently), waits
//! for all of them, and only then sleeps again. Ticks never overlap. The loop
//! starts with the first job and stops when nothing is left running.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::folders::JobFolders;
use super::jobstore::JobStore;
use super::models::{
    now_secs, ComputeAlgorithm, ComputeAsset, ComputeEnvironment, ComputeJob, ComputeJobStatus, ResultKind,
};
use super::runtime::{ContainerOptions, ContainerRuntime};
use super::state::{running_action, transition, Failure, Outcome, RunningAction, RunningObservation};
use crate::config::{DockerClusterConfig, EnvironmentConfig};
use crate::ddo::resolver::DdoLookup;
use crate::error::{NodeError, NodeResult};
use crate::storage::{FileObject, StorageClient};
use crate::stream::{self, ByteStream};

/// Where the job volume is mounted inside the container.
pub const CONTAINER_DATA_PATH: &str = "/data";
const ALGORITHM_PATH: &str = "/data/transformations/algorithm";
const OUTPUTS_PATH: &str = "/data/outputs";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cluster_hash: String,
    pub temp_folder: PathBuf,
    pub cron_time: Duration,
    pub storage_expiry: Duration,
    pub environments: Vec<ComputeEnvironment>,
    pub free: bool,
    /// Remove a finished job's storage this long after its results are fetched
    pub cleanup_after_retrieval: Option<Duration>,
}

impl EngineSettings {
    pub fn from_cluster(cluster: &DockerClusterConfig) -> NodeResult<Self> {
        let cluster_hash = cluster_hash(cluster)?;
        let environments = cluster
            .environments
            .iter()
            .map(|env| environment(&cluster_hash, env, false))
            .collect::<NodeResult<Vec<_>>>()?;
        Ok(Self {
            cluster_hash,
            temp_folder: cluster.temp_folder.clone(),
            cron_time: Duration::from_millis(cluster.cron_time_ms),
            storage_expiry: Duration::from_secs(cluster.storage_expiry_secs),
            environments,
            free: false,
            cleanup_after_retrieval: None,
        })
    }
}

/// sha256 of the cluster's connection settings.
pub fn cluster_hash(cluster: &DockerClusterConfig) -> NodeResult<String> {
    #[derive(Serialize)]
    struct Connection<'a> {
        docker_bin: &'a str,
        docker_host: Option<&'a str>,
        temp_folder: &'a Path,
    }
    let json = serde_json::to_string(&Connection {
        docker_bin: &cluster.docker_bin,
        docker_host: cluster.docker_host.as_deref(),
        temp_folder: &cluster.temp_folder,
    })?;
    Ok(hex::encode(Sha256::digest(json.as_bytes())))
}

/// Environment with its id `<clusterHash>-<sha256(env json)>`.
pub fn environment(cluster_hash: &str, config: &EnvironmentConfig, free: bool) -> NodeResult<ComputeEnvironment> {
    let digest = Sha256::digest(serde_json::to_string(config)?.as_bytes());
    Ok(ComputeEnvironment {
        id: format!("{}-{}", cluster_hash, hex::encode(digest)),
        cluster_hash: cluster_hash.to_string(),
        description: config.description.clone(),
        cpu_number: config.cpu,
        ram_gb: config.ram_gb,
        disk_gb: config.disk_gb,
        max_job_duration: config.max_job_duration_secs,
        fees: if free { Default::default() } else { config.fees.clone() },
        free,
        running_jobs: 0,
    })
}

/// A job submission.
#[derive(Debug, Clone)]
pub struct StartJob {
    pub owner: String,
    pub algorithm: ComputeAlgorithm,
    pub assets: Vec<ComputeAsset>,
    pub environment: String,
    /// Requested run time; ignored on free environments
    pub max_job_duration: Option<u64>,
    pub agreement_id: Option<String>,
}

/// A result file opened for reading.
pub struct ResultStream {
    pub content_type: &'static str,
    pub stream: ByteStream,
}

#[derive(Debug, Clone)]
enum PullState {
    Pending,
    Done,
    Failed(String),
}

struct EngineInner {
    settings: EngineSettings,
    runtime: Arc<dyn ContainerRuntime>,
    jobs: Arc<JobStore>,
    storage: StorageClient,
    ddos: Option<Arc<dyn DdoLookup>>,
    loop_running: AtomicBool,
    /// Held for the length of a tick
    tick_lock: tokio::sync::Mutex<()>,
    pulls: Mutex<HashMap<String, PullState>>,
}

#[derive(Clone)]
pub struct ComputeEngine {
    inner: Arc<EngineInner>,
}

impl ComputeEngine {
    pub fn new(
        settings: EngineSettings,
        runtime: Arc<dyn ContainerRuntime>,
        jobs: Arc<JobStore>,
        storage: StorageClient,
        ddos: Option<Arc<dyn DdoLookup>>,
    ) -> NodeResult<Self> {
        std::fs::create_dir_all(&settings.temp_folder)?;
        info!(
            cluster = %settings.cluster_hash,
            free = settings.free,
            environments = settings.environments.len(),
            "Compute engine initialized"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                settings,
                runtime,
                jobs,
                storage,
                ddos,
                loop_running: AtomicBool::new(false),
                tick_lock: tokio::sync::Mutex::new(()),
                pulls: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn cluster_hash(&self) -> &str {
        &self.inner.settings.cluster_hash
    }

    pub fn is_free(&self) -> bool {
        self.inner.settings.free
    }

    pub fn folders(&self, job_id: &str) -> JobFolders {
        JobFolders::new(&self.inner.settings.temp_folder, job_id)
    }

    pub fn has_environment(&self, id: &str) -> bool {
        self.inner.settings.environments.iter().any(|e| e.id == id)
    }

    /// Resume driving jobs left running by a previous process.
    pub fn resume(&self) -> NodeResult<()> {
        if !self.inner.jobs.running_jobs(self.cluster_hash())?.is_empty() {
            self.ensure_loop();
        }
        Ok(())
    }

    pub fn is_loop_running(&self) -> bool {
        self.inner.loop_running.load(Ordering::SeqCst)
    }

    //=========================================================================
    // PUBLIC OPERATIONS
    //=========================================================================

    pub fn environments(&self) -> NodeResult<Vec<ComputeEnvironment>> {
        let running = self.inner.jobs.running_jobs(self.cluster_hash())?;
        Ok(self
            .inner
            .settings
            .environments
            .iter()
            .cloned()
            .map(|mut env| {
                env.running_jobs = running.iter().filter(|j| j.environment == env.id).count();
                env
            })
            .collect())
    }

    pub async fn start_compute_job(&self, request: StartJob) -> NodeResult<ComputeJob> {
        let settings = &self.inner.settings;
        let env = settings
            .environments
            .iter()
            .find(|e| e.id == request.environment)
            .ok_or_else(|| NodeError::BadRequest(format!("Invalid environment {}", request.environment)))?;

        let container_image = request
            .algorithm
            .container()
            .filter(|c| !c.image.is_empty())
            .map(|c| c.image_reference())
            .ok_or_else(|| NodeError::BadRequest("Unable to extract docker image from algorithm".to_string()))?;

        let max_job_duration = if settings.free {
            env.max_job_duration
        } else {
            request
                .max_job_duration
                .map(|d| d.min(env.max_job_duration))
                .unwrap_or(env.max_job_duration)
        };

        let job_id = Uuid::new_v4().to_string();
        let job = ComputeJob {
            cluster_hash: settings.cluster_hash.clone(),
            job_id: job_id.clone(),
            owner: request.owner,
            container_image,
            date_created: now_secs(),
            date_finished: None,
            status: ComputeJobStatus::JobStarted,
            status_text: ComputeJobStatus::JobStarted.text().to_string(),
            results: vec![],
            algorithm: request.algorithm,
            assets: request.assets,
            agreement_id: request.agreement_id,
            environment: env.id.clone(),
            max_job_duration,
            expire_timestamp: 0,
            algo_start_timestamp: 0,
            algo_stop_timestamp: 0,
            config_log_url: None,
            algo_log_url: None,
            outputs_url: None,
            publish_log_url: None,
            stop_requested: false,
            is_running: true,
            is_started: false,
            is_free: settings.free,
        };

        self.folders(&job_id).create().await?;
        self.inner.jobs.new_job(&job)?;
        info!(job_id = %job.job_id, image = %job.container_image, owner = %job.owner, "Compute job accepted");

        self.ensure_loop();
        Ok(job)
    }

    /// Jobs of this cluster matching the filters, with their current results.
    pub async fn get_compute_job_status(
        &self,
        owner: Option<&str>,
        agreement_id: Option<&str>,
        job_id: Option<&str>,
    ) -> NodeResult<Vec<ComputeJob>> {
        let jobs = self.inner.jobs.get_jobs(job_id, agreement_id, owner)?;
        let mut out = Vec::with_capacity(jobs.len());
        for mut job in jobs.into_iter().filter(|j| j.cluster_hash == self.cluster_hash()) {
            job.results = self.folders(&job.job_id).results().await;
            out.push(job);
        }
        Ok(out)
    }

    /// Open result `index` of a job. `None` when `owner` does not own the job
    /// or no such result exists.
    pub async fn get_compute_job_result(
        &self,
        owner: &str,
        job_id: &str,
        index: usize,
    ) -> NodeResult<Option<ResultStream>> {
        let job = self
            .inner
            .jobs
            .get_job(job_id)?
            .filter(|j| j.cluster_hash == self.cluster_hash())
            .ok_or_else(|| NodeError::NotFound(format!("Cannot find job with id {}", job_id)))?;
        if job.owner != owner {
            warn!(%job_id, caller = %owner, "Result requested by someone other than the job owner");
            return Ok(None);
        }

        let folders = self.folders(job_id);
        let Some(result) = folders.results().await.into_iter().find(|r| r.index == index) else {
            return Ok(None);
        };
        let file = tokio::fs::File::open(folders.log(result.kind)).await?;

        if let Some(delay) = self.inner.settings.cleanup_after_retrieval {
            if !job.is_running {
                let engine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    engine.cleanup_storage(&job, true).await;
                });
            }
        }

        Ok(Some(ResultStream {
            content_type: result.kind.content_type(),
            stream: stream::from_reader(file),
        }))
    }

    pub async fn stop_compute_job(&self, owner: &str, job_id: &str) -> NodeResult<Vec<ComputeJob>> {
        let job = self
            .inner
            .jobs
            .get_job(job_id)?
            .filter(|j| j.cluster_hash == self.cluster_hash())
            .ok_or_else(|| NodeError::NotFound(format!("Cannot find job with id {}", job_id)))?;
        if job.owner != owner {
            return Err(NodeError::Forbidden(format!(
                "{} is not allowed to stop job {}",
                owner, job_id
            )));
        }
        if job.is_running {
            self.inner.jobs.request_stop(job_id)?;
            info!(%job_id, "Stop requested");
        }
        self.get_compute_job_status(None, None, Some(job_id)).await
    }

    /// Live log stream, only while the job's container is running.
    pub async fn get_streamable_logs(&self, job_id: &str) -> NodeResult<Option<ByteStream>> {
        let Some(job) = self.inner.jobs.get_job(job_id)? else {
            return Ok(None);
        };
        if !job.is_running {
            return Ok(None);
        }
        let name = job.container_name();
        match self.inner.runtime.inspect_container(&name).await {
            Ok(state) if state.running => {}
            _ => return Ok(None),
        }
        match self.inner.runtime.container_logs(&name, true).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) => {
                debug!(%job_id, error = %e, "Could not attach to container logs");
                Ok(None)
            }
        }
    }

    /// Delete storage and records of jobs finished longer than the expiry ago.
    pub async fn cleanup_expired_storage(&self) -> NodeResult<usize> {
        let cutoff = now_secs() - self.inner.settings.storage_expiry.as_secs() as i64;
        let expired = self.inner.jobs.finished_before(self.cluster_hash(), cutoff)?;
        for job in &expired {
            self.cleanup_storage(job, false).await;
        }
        Ok(expired.len())
    }

    async fn cleanup_storage(&self, job: &ComputeJob, after_download: bool) {
        info!(job_id = %job.job_id, "Cleaning up compute storage");
        let folders = self.folders(&job.job_id);
        if !after_download {
            self.release_resources(job, &folders).await;
        }
        folders.remove_all().await;
        if let Err(e) = self.inner.jobs.delete_job(&job.job_id) {
            error!(job_id = %job.job_id, error = %e, "Failed to delete job record");
        }
    }

    //=========================================================================
    // DRIVING LOOP
    //=========================================================================

    fn ensure_loop(&self) {
        if self.inner.loop_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            debug!(cluster = %engine.cluster_hash(), "Compute loop started");
            loop {
                tokio::time::sleep(engine.inner.settings.cron_time).await;
                engine.tick().await;
                if engine.has_running_jobs() {
                    continue;
                }
                engine.inner.loop_running.store(false, Ordering::SeqCst);
                // A job may have been accepted between the query and the store
                if engine.has_running_jobs() && !engine.inner.loop_running.swap(true, Ordering::SeqCst) {
                    continue;
                }
                break;
            }
            debug!(cluster = %engine.cluster_hash(), "Compute loop idle, stopping");
        });
    }

    fn has_running_jobs(&self) -> bool {
        match self.inner.jobs.running_jobs(self.cluster_hash()) {
            Ok(jobs) => !jobs.is_empty(),
            Err(e) => {
                error!(error = %e, "Failed to query running jobs");
                true
            }
        }
    }

    /// One pass over every running job. Concurrent callers queue behind the
    /// tick in progress.
    pub async fn tick(&self) {
        let _ticking = self.inner.tick_lock.lock().await;
        let jobs = match self.inner.jobs.running_jobs(self.cluster_hash()) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load running jobs");
                return;
            }
        };
        if !jobs.is_empty() {
            debug!(cluster = %self.cluster_hash(), count = jobs.len(), "Processing compute jobs");
        }
        join_all(jobs.into_iter().map(|job| self.process_job(job))).await;

        if let Err(e) = self.cleanup_expired_storage().await {
            warn!(error = %e, "Expired storage cleanup failed");
        }
    }

    async fn process_job(&self, job: ComputeJob) {
        let job_id = job.job_id.clone();
        if let Err(e) = self.step(job).await {
            error!(%job_id, error = %e, "Compute job step failed");
        }
    }

    /// Advance `job` by at most one transition and write it back.
    async fn step(&self, mut job: ComputeJob) -> NodeResult<()> {
        let folders = self.folders(&job.job_id);
        debug!(job_id = %job.job_id, status = ?job.status, "Processing job");

        let outcome = match job.status {
            ComputeJobStatus::JobStarted => self.begin_pull(&job, &folders),
            ComputeJobStatus::PullImage => self.poll_pull(&job, &folders),
            ComputeJobStatus::ConfiguringVolumes => self.configure(&job, &folders).await,
            ComputeJobStatus::Provisioning => self.provision(&job, &folders).await,
            ComputeJobStatus::RunningAlgorithm => self.drive_running(&mut job, &folders).await,
            ComputeJobStatus::PublishingResults => self.publish(&job, &folders).await,
            status => {
                // Terminal but still flagged running; settle it
                job.finish(status);
                self.inner.jobs.update_job(&job)?;
                return Ok(());
            }
        };

        let next = transition(job.status, outcome).map_err(|e| NodeError::Internal(e.to_string()))?;
        if next != job.status {
            info!(job_id = %job.job_id, from = ?job.status, to = ?next, "Job status changed");
        }
        if next.is_terminal() {
            job.finish(next);
            self.inner.jobs.update_job(&job)?;
            self.release_resources(&job, &folders).await;
        } else {
            job.set_status(next);
            self.inner.jobs.update_job(&job)?;
        }
        Ok(())
    }

    fn pull_state(&self, job_id: &str) -> Option<PullState> {
        self.inner.pulls.lock().ok()?.get(job_id).cloned()
    }

    fn set_pull_state(&self, job_id: &str, state: Option<PullState>) {
        if let Ok(mut pulls) = self.inner.pulls.lock() {
            match state {
                Some(state) => pulls.insert(job_id.to_string(), state),
                None => pulls.remove(job_id),
            };
        }
    }

    /// Start pulling the image in the background.
    fn begin_pull(&self, job: &ComputeJob, folders: &JobFolders) -> Outcome {
        self.set_pull_state(&job.job_id, Some(PullState::Pending));
        let engine = self.clone();
        let job_id = job.job_id.clone();
        let image = job.container_image.clone();
        let folders = folders.clone();
        tokio::spawn(async move {
            let state = match engine.inner.runtime.pull_image(&image).await {
                Ok(output) => {
                    folders.append_log(ResultKind::ImageLog, &output).await;
                    folders
                        .append_log(ResultKind::ImageLog, &format!("Successfully pulled image: {}", image))
                        .await;
                    PullState::Done
                }
                Err(e) => {
                    let message = format!("Unable to pull docker image: {}: {:#}", image, e);
                    error!(%job_id, "{}", message);
                    folders.append_log(ResultKind::ImageLog, &message).await;
                    PullState::Failed(message)
                }
            };
            engine.set_pull_state(&job_id, Some(state));
        });
        Outcome::Advance
    }

    fn poll_pull(&self, job: &ComputeJob, folders: &JobFolders) -> Outcome {
        match self.pull_state(&job.job_id) {
            Some(PullState::Pending) => Outcome::Wait,
            Some(PullState::Done) => {
                self.set_pull_state(&job.job_id, None);
                Outcome::Advance
            }
            Some(PullState::Failed(reason)) => {
                debug!(job_id = %job.job_id, %reason, "Image pull failed");
                self.set_pull_state(&job.job_id, None);
                Outcome::Fail(Failure::PullImage)
            }
            // Lost across a restart
            None => {
                self.begin_pull(job, folders);
                Outcome::Wait
            }
        }
    }

    fn container_options(&self, job: &ComputeJob) -> ContainerOptions {
        let env = self
            .inner
            .settings
            .environments
            .iter()
            .find(|e| e.id == job.environment);
        let entrypoint = job
            .algorithm
            .container()
            .and_then(|c| c.entrypoint.as_deref())
            .map(|e| {
                e.replace("$ALGO", ALGORITHM_PATH)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|parts| !parts.is_empty());
        ContainerOptions {
            name: job.container_name(),
            image: job.container_image.clone(),
            volume: job.volume_name(),
            mount_path: CONTAINER_DATA_PATH.to_string(),
            entrypoint,
            env: job
                .algorithm
                .envs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            memory_bytes: env
                .filter(|e| e.ram_gb > 0)
                .map(|e| e.ram_gb as u64 * 1024 * 1024 * 1024),
            cpus: env.filter(|e| e.cpu_number > 0).map(|e| e.cpu_number as f64),
        }
    }

    async fn configure(&self, job: &ComputeJob, folders: &JobFolders) -> Outcome {
        let runtime = &self.inner.runtime;
        if let Err(e) = runtime.create_volume(&job.volume_name()).await {
            folders
                .append_log(ResultKind::ConfigurationLog, &format!("Unable to create volume: {:#}", e))
                .await;
            return Outcome::Fail(Failure::VolumeCreation);
        }
        if let Err(e) = runtime.create_container(&self.container_options(job)).await {
            folders
                .append_log(ResultKind::ConfigurationLog, &format!("Unable to create container: {:#}", e))
                .await;
            return Outcome::Fail(Failure::ContainerCreation);
        }
        Outcome::Advance
    }

    async fn write_ddo(&self, document_id: Option<&str>, folders: &JobFolders) {
        let (Some(id), Some(ddos)) = (document_id, self.inner.ddos.as_ref()) else {
            return;
        };
        match ddos.lookup_ddo(id).await {
            Some(ddo) => {
                let result = async {
                    let bytes = serde_json::to_vec(&ddo)?;
                    tokio::fs::write(folders.ddos().join(id), bytes).await?;
                    Ok::<_, NodeError>(())
                }
                .await;
                if let Err(e) = result {
                    warn!(%id, error = %e, "Could not write DDO into job folder");
                }
            }
            None => {
                folders
                    .append_log(ResultKind::ConfigurationLog, &format!("DDO {} not found, skipping", id))
                    .await;
            }
        }
    }

    async fn download(&self, file: &FileObject, dest: &Path, folders: &JobFolders) -> NodeResult<()> {
        folders
            .append_log(
                ResultKind::ConfigurationLog,
                &format!("Downloading {} file to {}", file.type_name(), dest.display()),
            )
            .await;
        self.inner.storage.download_to(file, dest).await.map(|_| ())
    }

    /// Stage algorithm and inputs, archive them and upload into the container.
    async fn provision(&self, job: &ComputeJob, folders: &JobFolders) -> Outcome {
        let algorithm = &job.algorithm;

        config_log(folders, "Writing algocustom data to '/data/inputs/algoCustomData.json'".to_string()).await;
        let custom = algorithm.algocustomdata.clone().unwrap_or_else(|| serde_json::json!({}));
        let custom_written = match serde_json::to_vec(&custom) {
            Ok(bytes) => tokio::fs::write(folders.inputs().join("algoCustomData.json"), bytes)
                .await
                .map_err(NodeError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = custom_written {
            config_log(folders, format!("Unable to write algorithm custom data: {}", e)).await;
            return Outcome::Fail(Failure::AlgorithmProvisioning);
        }

        let algorithm_written = if let Some(code) = algorithm.rawcode() {
            config_log(folders, format!("Writing raw algo code to {}", ALGORITHM_PATH)).await;
            tokio::fs::write(folders.algorithm(), code).await.map_err(NodeError::from)
        } else if let Some(file) = &algorithm.file_object {
            self.download(file, &folders.algorithm(), folders).await
        } else {
            config_log(folders, "Could not extract any files object from the compute algorithm, skipping...".to_string()).await;
            Ok(())
        };
        if let Err(e) = algorithm_written {
            config_log(folders, format!("Unable to write algorithm to {}: {}", ALGORITHM_PATH, e)).await;
            return Outcome::Fail(Failure::AlgorithmProvisioning);
        }
        self.write_ddo(algorithm.document_id.as_deref(), folders).await;

        for (index, asset) in job.assets.iter().enumerate() {
            self.write_ddo(asset.document_id.as_deref(), folders).await;
            let Some(file) = &asset.file_object else {
                config_log(folders, format!("Asset {} has no files object, skipping...", index)).await;
                continue;
            };
            let dest = folders.inputs().join(index.to_string());
            if let Err(e) = self.download(file, &dest, folders).await {
                config_log(folders, format!("Unable to write input data to {}: {}", dest.display(), e)).await;
                return Outcome::Fail(Failure::DataProvisioning);
            }
        }

        config_log(folders, "All good with data provisioning, will start uploading it...".to_string()).await;
        let data = folders.data();
        let archive = folders.upload_archive();
        let built = {
            let archive = archive.clone();
            tokio::task::spawn_blocking(move || create_archive(&data, &archive)).await
        };
        match built {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                config_log(folders, format!("Error creating data archive: {:#}", e)).await;
                return Outcome::Fail(Failure::DataProvisioning);
            }
            Err(e) => {
                config_log(folders, format!("Error creating data archive: {}", e)).await;
                return Outcome::Fail(Failure::DataProvisioning);
            }
        }

        if let Err(e) = self
            .inner
            .runtime
            .put_archive(&job.container_name(), CONTAINER_DATA_PATH, &archive)
            .await
        {
            config_log(folders, format!("Data upload to container failed: {:#}", e)).await;
            return Outcome::Fail(Failure::DataUpload);
        }

        folders.remove_staging().await;
        Outcome::Advance
    }

    async fn drive_running(&self, job: &mut ComputeJob, folders: &JobFolders) -> Outcome {
        let runtime = &self.inner.runtime;
        let name = job.container_name();
        let state = match runtime.inspect_container(&name).await {
            Ok(state) => state,
            Err(e) => {
                // Transient; try again next tick
                warn!(job_id = %job.job_id, error = %e, "Could not inspect container");
                return Outcome::Wait;
            }
        };

        let now = now_secs();
        let observation = RunningObservation {
            started: job.is_started,
            container_running: state.running,
            expired: job.is_started && now > job.expire_timestamp,
            stop_requested: job.stop_requested,
        };
        match running_action(observation) {
            RunningAction::Wait => Outcome::Wait,
            RunningAction::Start => match runtime.start_container(&name).await {
                Ok(()) => {
                    job.is_started = true;
                    job.algo_start_timestamp = now;
                    job.expire_timestamp = now + job.max_job_duration as i64;
                    info!(job_id = %job.job_id, expires = job.expire_timestamp, "Container started");
                    Outcome::Wait
                }
                Err(e) => {
                    job.algo_start_timestamp = now;
                    job.algo_stop_timestamp = now;
                    let message = format!("{:#}", e);
                    if let Err(e) = tokio::fs::write(folders.log(ResultKind::AlgorithmLog), &message).await {
                        warn!(error = %e, "Failed to write algorithm log");
                    }
                    error!(job_id = %job.job_id, error = %message, "Could not start container");
                    Outcome::Fail(Failure::Algorithm)
                }
            },
            RunningAction::StopAndPublish => {
                if let Err(e) = runtime.stop_container(&name).await {
                    debug!(job_id = %job.job_id, error = %e, "Could not stop container");
                }
                job.algo_stop_timestamp = now;
                Outcome::Advance
            }
            RunningAction::Publish => {
                job.algo_stop_timestamp = now;
                Outcome::Advance
            }
        }
    }

    async fn publish(&self, job: &ComputeJob, folders: &JobFolders) -> Outcome {
        let name = job.container_name();
        if let Ok(state) = self.inner.runtime.inspect_container(&name).await {
            folders
                .append_log(
                    ResultKind::PublishLog,
                    &format!("Container exited with code {} (OOM killed: {})", state.exit_code, state.oom_killed),
                )
                .await;
        }
        match self
            .inner
            .runtime
            .get_archive(&name, OUTPUTS_PATH, &folders.outputs_archive())
            .await
        {
            Ok(()) => {
                folders.append_log(ResultKind::PublishLog, "Outputs archived").await;
                Outcome::Advance
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Failed to get outputs archive");
                folders
                    .append_log(ResultKind::PublishLog, &format!("Failed to get outputs archive: {:#}", e))
                    .await;
                Outcome::Fail(Failure::ResultsFetch)
            }
        }
    }

    /// Tear down the container, volume and staging folders of a finished job.
    async fn release_resources(&self, job: &ComputeJob, folders: &JobFolders) {
        let runtime = &self.inner.runtime;
        let name = job.container_name();
        if job.status != ComputeJobStatus::AlgorithmFailed {
            match runtime.container_logs(&name, false).await {
                Ok(logs) => match stream::collect(logs, usize::MAX).await {
                    Ok(bytes) => {
                        if let Err(e) = tokio::fs::write(folders.log(ResultKind::AlgorithmLog), bytes).await {
                            warn!(error = %e, "Failed to write algorithm log");
                        }
                    }
                    Err(e) => debug!(error = %e, "Reading container logs failed"),
                },
                Err(e) => debug!(job_id = %job.job_id, error = %e, "No container logs"),
            }
        }
        if let Err(e) = runtime.remove_container(&name).await {
            debug!(job_id = %job.job_id, error = %e, "Container not removed");
        }
        if let Err(e) = runtime.remove_volume(&job.volume_name()).await {
            debug!(job_id = %job.job_id, error = %e, "Volume not removed");
        }
        self.set_pull_state(&job.job_id, None);
        folders.remove_staging().await;
    }
}

async fn config_log(folders: &JobFolders, line: String) {
    folders.append_log(ResultKind::ConfigurationLog, &line).await
}

fn create_archive(source: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", source).context("adding files to archive")?;
    let encoder = builder.into_inner().context("finishing tar archive")?;
    encoder.finish().context("finishing gzip compression")?;
    Ok(())
}
