use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compute::models::{AlgorithmMeta, ComputeAlgorithm, ComputeAsset};
use crate::compute::{ComputeEngine, StartJob};
use crate::context::NodeContext;
use crate::dispatcher::{CommandHandler, CommandResponse};
use crate::error::{NodeError, NodeResult};
use crate::p2p::protocols::CommandStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetComputeEnvironmentsCommand {}

#[async_trait]
impl CommandHandler for GetComputeEnvironmentsCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        CommandResponse::json(&ctx.compute.environments()?)
    }
}

/// Submit a job to a free environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeStartComputeCommand {
    pub consumer_address: String,
    pub algorithm: ComputeAlgorithm,
    pub datasets: Vec<ComputeAsset>,
    /// Defaults to the first free environment
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub agreement_id: Option<String>,
}

impl FreeStartComputeCommand {
    fn engine<'a>(&self, ctx: &'a NodeContext) -> NodeResult<&'a ComputeEngine> {
        let engine = match &self.environment {
            Some(env) => ctx
                .compute
                .for_environment(env)
                .ok_or_else(|| NodeError::BadRequest(format!("Invalid environment {}", env)))?,
            None => ctx
                .compute
                .free()
                .ok_or_else(|| NodeError::BadRequest("No free compute environment available".to_string()))?,
        };
        if !engine.is_free() {
            return Err(NodeError::BadRequest("Environment is not free".to_string()));
        }
        Ok(engine)
    }

    /// Fill in container metadata from the algorithm's DDO when the caller only gave its id.
    async fn resolve_algorithm(&mut self, ctx: &NodeContext) -> NodeResult<()> {
        if self.algorithm.container().is_some() {
            return Ok(());
        }
        let Some(id) = self.algorithm.document_id.clone() else {
            return Ok(());
        };
        let ddo = ctx
            .resolver
            .find_and_format_ddo(&id, false)
            .await?
            .ok_or_else(|| NodeError::NotFound(format!("DDO {} not found", id)))?;
        let meta: AlgorithmMeta = ddo
            .pointer("/metadata/algorithm")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        self.algorithm.meta = Some(meta);
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for FreeStartComputeCommand {
    async fn handle(mut self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        let engine = self.engine(ctx)?.clone();
        self.resolve_algorithm(ctx).await?;
        for asset in &self.datasets {
            if let Some(file) = &asset.file_object {
                ctx.storage.validate(file)?;
            }
        }
        let environment = match self.environment {
            Some(env) => env,
            None => engine
                .environments()?
                .into_iter()
                .next()
                .map(|e| e.id)
                .ok_or_else(|| NodeError::BadRequest("No free compute environment available".to_string()))?,
        };
        let job = engine
            .start_compute_job(StartJob {
                owner: self.consumer_address,
                algorithm: self.algorithm,
                assets: self.datasets,
                environment,
                max_job_duration: None,
                agreement_id: self.agreement_id,
            })
            .await?;
        info!(job_id = %job.job_id, "Free compute job started");
        CommandResponse::json(&vec![job])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetComputeStatusCommand {
    #[serde(default)]
    pub consumer_address: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub agreement_id: Option<String>,
}

#[async_trait]
impl CommandHandler for GetComputeStatusCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        if self.consumer_address.is_none() && self.job_id.is_none() && self.agreement_id.is_none() {
            return Err(NodeError::BadRequest(
                "Missing jobId or consumerAddress or agreementId".to_string(),
            ));
        }
        let jobs = ctx
            .compute
            .job_status(
                self.consumer_address.as_deref(),
                self.agreement_id.as_deref(),
                self.job_id.as_deref(),
            )
            .await?;
        CommandResponse::json(&jobs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetComputeResultCommand {
    pub consumer_address: String,
    pub job_id: String,
    pub index: usize,
}

#[async_trait]
impl CommandHandler for GetComputeResultCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        let engine = ctx.compute.for_job(&self.job_id)?;
        let Some(result) = engine
            .get_compute_job_result(&self.consumer_address, &self.job_id, self.index)
            .await?
        else {
            return Ok(CommandResponse::error(404, "Result not found"));
        };
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), result.content_type.to_string());
        Ok(CommandResponse {
            status: CommandStatus {
                headers: Some(headers),
                ..CommandStatus::ok()
            },
            stream: Some(result.stream),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopComputeCommand {
    pub consumer_address: String,
    pub job_id: String,
}

#[async_trait]
impl CommandHandler for StopComputeCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        let engine = ctx.compute.for_job(&self.job_id)?;
        let jobs = engine.stop_compute_job(&self.consumer_address, &self.job_id).await?;
        CommandResponse::json(&jobs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetComputeStreamableLogsCommand {
    pub consumer_address: String,
    pub job_id: String,
}

#[async_trait]
impl CommandHandler for GetComputeStreamableLogsCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        let engine = ctx.compute.for_job(&self.job_id)?;
        let owned = engine
            .get_compute_job_status(Some(&self.consumer_address), None, Some(&self.job_id))
            .await?;
        if owned.is_empty() {
            return Err(NodeError::Forbidden(format!(
                "{} does not own job {}",
                self.consumer_address, self.job_id
            )));
        }
        match engine.get_streamable_logs(&self.job_id).await? {
            Some(stream) => Ok(CommandResponse::ok(stream)),
            None => Ok(CommandResponse::error(404, "Job is not running")),
        }
    }
}
