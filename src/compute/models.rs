//! Compute models - jobs, statuses, environments and algorithm descriptors
//!
//! Serialized camelCase, the shape callers see in compute command responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::config::FeeConfig;
use crate::storage::FileObject;

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

//=============================================================================
// STATUS
//=============================================================================

/// Lifecycle of a compute job. Numeric values travel on the wire and order
/// the happy path; failures sit one above the stage that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum ComputeJobStatus {
    JobStarted = 0,
    PullImage = 10,
    PullImageFailed = 11,
    ConfiguringVolumes = 20,
    VolumeCreationFailed = 21,
    ContainerCreationFailed = 22,
    Provisioning = 30,
    DataProvisioningFailed = 31,
    AlgorithmProvisioningFailed = 32,
    DataUploadFailed = 33,
    RunningAlgorithm = 40,
    AlgorithmFailed = 41,
    PublishingResults = 60,
    ResultsFetchFailed = 61,
    JobFinished = 70,
}

impl ComputeJobStatus {
    pub const ALL: [ComputeJobStatus; 15] = [
        Self::JobStarted,
        Self::PullImage,
        Self::PullImageFailed,
        Self::ConfiguringVolumes,
        Self::VolumeCreationFailed,
        Self::ContainerCreationFailed,
        Self::Provisioning,
        Self::DataProvisioningFailed,
        Self::AlgorithmProvisioningFailed,
        Self::DataUploadFailed,
        Self::RunningAlgorithm,
        Self::AlgorithmFailed,
        Self::PublishingResults,
        Self::ResultsFetchFailed,
        Self::JobFinished,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::JobStarted => "Job started",
            Self::PullImage => "Pulling algorithm image",
            Self::PullImageFailed => "Pulling algorithm image failed",
            Self::ConfiguringVolumes => "Configuring volumes",
            Self::VolumeCreationFailed => "Volume creation failed",
            Self::ContainerCreationFailed => "Container creation failed",
            Self::Provisioning => "Provisioning data",
            Self::DataProvisioningFailed => "Data provisioning failed",
            Self::AlgorithmProvisioningFailed => "Algorithm provisioning failed",
            Self::DataUploadFailed => "Data upload to container failed",
            Self::RunningAlgorithm => "Running algorithm",
            Self::AlgorithmFailed => "Failed to run algorithm",
            Self::PublishingResults => "Publishing results",
            Self::ResultsFetchFailed => "Failed to fetch results",
            Self::JobFinished => "Job finished",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::PullImageFailed
                | Self::VolumeCreationFailed
                | Self::ContainerCreationFailed
                | Self::DataProvisioningFailed
                | Self::AlgorithmProvisioningFailed
                | Self::DataUploadFailed
                | Self::AlgorithmFailed
                | Self::ResultsFetchFailed
        )
    }

    /// No outgoing transitions.
    pub fn is_terminal(self) -> bool {
        self.is_failure() || self == Self::JobFinished
    }
}

impl Serialize for ComputeJobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

impl<'de> Deserialize<'de> for ComputeJobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u16::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| serde::de::Error::custom(format!("unknown compute status {}", code)))
    }
}

//=============================================================================
// ALGORITHM AND ASSETS
//=============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// `$ALGO` is replaced with the algorithm path inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

impl ContainerSpec {
    /// `image@checksum`, else `image:tag`, else `image:latest`.
    pub fn image_reference(&self) -> String {
        match (&self.checksum, &self.tag) {
            (Some(checksum), _) if !checksum.is_empty() => format!("{}@{}", self.image, checksum),
            (_, Some(tag)) if !tag.is_empty() => format!("{}:{}", self.image, tag),
            _ => format!("{}:latest", self.image),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rawcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeAlgorithm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_object: Option<FileObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<AlgorithmMeta>,
    #[serde(default, rename = "algocustomdata", skip_serializing_if = "Option::is_none")]
    pub algocustomdata: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,
}

impl ComputeAlgorithm {
    pub fn container(&self) -> Option<&ContainerSpec> {
        self.meta.as_ref()?.container.as_ref()
    }

    pub fn rawcode(&self) -> Option<&str> {
        self.meta
            .as_ref()?
            .rawcode
            .as_deref()
            .filter(|code| !code.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeAsset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_object: Option<FileObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<Value>,
}

//=============================================================================
// JOBS AND RESULTS
//=============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultKind {
    ImageLog,
    ConfigurationLog,
    AlgorithmLog,
    Output,
    PublishLog,
}

impl ResultKind {
    pub fn content_type(self) -> &'static str {
        match self {
            ResultKind::Output => "application/octet-stream",
            _ => "text/plain",
        }
    }
}

/// A downloadable artefact of a job, derived from files on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResult {
    pub filename: String,
    pub filesize: u64,
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeJob {
    pub cluster_hash: String,
    pub job_id: String,
    pub owner: String,
    pub container_image: String,
    pub date_created: i64,
    #[serde(default)]
    pub date_finished: Option<i64>,
    pub status: ComputeJobStatus,
    pub status_text: String,
    #[serde(default)]
    pub results: Vec<ComputeResult>,
    pub algorithm: ComputeAlgorithm,
    pub assets: Vec<ComputeAsset>,
    #[serde(default)]
    pub agreement_id: Option<String>,
    pub environment: String,
    /// Seconds the algorithm may run once started
    pub max_job_duration: u64,
    /// When the running container is force-stopped; 0 until it starts
    #[serde(default)]
    pub expire_timestamp: i64,
    #[serde(default)]
    pub algo_start_timestamp: i64,
    #[serde(default)]
    pub algo_stop_timestamp: i64,
    #[serde(default)]
    pub config_log_url: Option<String>,
    #[serde(default)]
    pub algo_log_url: Option<String>,
    #[serde(default)]
    pub outputs_url: Option<String>,
    #[serde(default)]
    pub publish_log_url: Option<String>,
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub is_started: bool,
    #[serde(default)]
    pub is_free: bool,
}

impl ComputeJob {
    pub fn set_status(&mut self, status: ComputeJobStatus) {
        self.status = status;
        self.status_text = status.text().to_string();
    }

    /// Mark the job as no longer driven by the engine.
    pub fn finish(&mut self, status: ComputeJobStatus) {
        self.set_status(status);
        self.is_running = false;
        self.date_finished = Some(now_secs());
    }

    pub fn container_name(&self) -> String {
        format!("{}-algoritm", self.job_id)
    }

    pub fn volume_name(&self) -> String {
        format!("{}-volume", self.job_id)
    }
}

//=============================================================================
// ENVIRONMENTS
//=============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeEnvironment {
    /// `<clusterHash>-<sha256(environment json)>`
    pub id: String,
    pub cluster_hash: String,
    pub description: String,
    pub cpu_number: u32,
    pub ram_gb: u32,
    pub disk_gb: u32,
    pub max_job_duration: u64,
    #[serde(default)]
    pub fees: BTreeMap<String, Vec<FeeConfig>>,
    pub free: bool,
    pub running_jobs: usize,
}
