//! Free-tier engine settings
//!
//! A free engine runs on the same docker cluster as its parent but keeps its
//! own identity, working root and single environment. Durations are fixed by
//! the environment and results are cleaned up shortly after they are fetched.

use std::time::Duration;

use sha2::{Digest, Sha256};

use super::engine::{cluster_hash, EngineSettings};
use super::models::ComputeEnvironment;
use crate::config::{DockerClusterConfig, FreeEnvironmentConfig};
use crate::error::NodeResult;

/// Delay between a result download and removal of the job's storage.
pub const CLEANUP_AFTER_RETRIEVAL: Duration = Duration::from_secs(5);

/// sha256("free" + parent cluster hash)
pub fn free_cluster_hash(parent_hash: &str) -> String {
    hex::encode(Sha256::digest(format!("free{}", parent_hash).as_bytes()))
}

pub fn free_environment(hash: &str, config: &FreeEnvironmentConfig) -> NodeResult<ComputeEnvironment> {
    let digest = Sha256::digest(serde_json::to_string(config)?.as_bytes());
    Ok(ComputeEnvironment {
        id: format!("{}-{}", hash, hex::encode(digest)),
        cluster_hash: hash.to_string(),
        description: "Free compute environment".to_string(),
        cpu_number: config.cpu,
        ram_gb: config.ram_gb,
        disk_gb: config.disk_gb,
        max_job_duration: config.max_job_duration_secs,
        fees: Default::default(),
        free: true,
        running_jobs: 0,
    })
}

/// Settings for the free engine of `cluster`, if it declares one.
pub fn free_settings(cluster: &DockerClusterConfig) -> NodeResult<Option<EngineSettings>> {
    let Some(free) = &cluster.free else {
        return Ok(None);
    };
    let hash = free_cluster_hash(&cluster_hash(cluster)?);
    let environment = free_environment(&hash, free)?;
    Ok(Some(EngineSettings {
        cluster_hash: hash,
        temp_folder: cluster.temp_folder.join("free"),
        cron_time: Duration::from_millis(cluster.cron_time_ms),
        storage_expiry: Duration::from_secs(cluster.storage_expiry_secs),
        environments: vec![environment],
        free: true,
        cleanup_after_retrieval: Some(CLEANUP_AFTER_RETRIEVAL),
    }))
}
