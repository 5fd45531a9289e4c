//! Command dispatcher - decoding, admission and handler selection
//!
//! Handles:
//! - Decoding one JSON command object per inbound stream
//! - Deny list and per-caller rate limiting for network callers
//! - A closed [`Command`] enum; each variant's payload implements [`CommandHandler`]
//! - Direct in-process dispatch with the same status/stream contract

pub mod handlers;
pub mod limits;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::NodeContext;
use crate::error::{NodeError, NodeResult};
use crate::p2p::protocols::{CommandStatus, WireResponse};
use crate::stream::{self, ByteStream};

pub use handlers::compute::{
    FreeStartComputeCommand, GetComputeEnvironmentsCommand, GetComputeResultCommand, GetComputeStatusCommand,
    GetComputeStreamableLogsCommand, StopComputeCommand,
};
pub use handlers::ddo::{FindDdoCommand, FindProvidersCommand, GetDdoCommand};
pub use handlers::misc::{EchoCommand, FileInfoCommand};
pub use handlers::node::{NodeStatus, NonceCommand, StatusCommand};
pub use limits::{Admission, RequestLimits};

/// Status plus optional payload, as produced by every handler.
pub struct CommandResponse {
    pub status: CommandStatus,
    pub stream: Option<ByteStream>,
}

impl CommandResponse {
    pub fn ok(stream: ByteStream) -> Self {
        Self {
            status: CommandStatus::ok(),
            stream: Some(stream),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> NodeResult<Self> {
        Ok(Self::ok(stream::once(serde_json::to_vec(value)?)))
    }

    pub fn error(http_status: u16, message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::error(http_status, message),
            stream: None,
        }
    }

    pub fn from_error(e: &NodeError) -> Self {
        Self::error(e.http_status(), e.to_string())
    }

    /// Drain the payload into memory for the wire. A payload that fails
    /// midway turns into a 500.
    pub async fn into_wire(self, limit: usize) -> WireResponse {
        let body = match self.stream {
            Some(s) => match stream::collect(s, limit).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "Response payload could not be read");
                    return WireResponse {
                        status: CommandStatus::error(500, e.to_string()),
                        body: vec![],
                    };
                }
            },
            None => vec![],
        };
        WireResponse {
            status: self.status,
            body,
        }
    }
}

/// One command kind's behaviour. Errors are turned into a status by the dispatcher.
#[async_trait]
pub trait CommandHandler: Send {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse>;
}

/// Every command this node answers, keyed by the `command` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    #[serde(rename = "echo")]
    Echo(EchoCommand),
    #[serde(rename = "status")]
    Status(StatusCommand),
    #[serde(rename = "nonce")]
    Nonce(NonceCommand),
    #[serde(rename = "getDDO")]
    GetDdo(GetDdoCommand),
    #[serde(rename = "findDDO")]
    FindDdo(FindDdoCommand),
    #[serde(rename = "findProviders")]
    FindProviders(FindProvidersCommand),
    #[serde(rename = "fileInfo")]
    FileInfo(FileInfoCommand),
    #[serde(rename = "getComputeEnvironments")]
    GetComputeEnvironments(GetComputeEnvironmentsCommand),
    #[serde(rename = "freeStartCompute")]
    FreeStartCompute(FreeStartComputeCommand),
    #[serde(rename = "getComputeStatus")]
    GetComputeStatus(GetComputeStatusCommand),
    #[serde(rename = "getComputeResult")]
    GetComputeResult(GetComputeResultCommand),
    #[serde(rename = "stopCompute")]
    StopCompute(StopComputeCommand),
    #[serde(rename = "getComputeStreamableLogs")]
    GetComputeStreamableLogs(GetComputeStreamableLogsCommand),
}

/// Command names with the parameters each one requires.
const REGISTRY: &[(&str, &[&str])] = &[
    ("echo", &[]),
    ("status", &[]),
    ("nonce", &["address"]),
    ("getDDO", &["id"]),
    ("findDDO", &["id"]),
    ("findProviders", &["id"]),
    ("fileInfo", &["type"]),
    ("getComputeEnvironments", &[]),
    ("freeStartCompute", &["consumerAddress", "algorithm", "datasets"]),
    ("getComputeStatus", &[]),
    ("getComputeResult", &["consumerAddress", "jobId", "index"]),
    ("stopCompute", &["consumerAddress", "jobId"]),
    ("getComputeStreamableLogs", &["consumerAddress", "jobId"]),
];

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Echo(_) => "echo",
            Command::Status(_) => "status",
            Command::Nonce(_) => "nonce",
            Command::GetDdo(_) => "getDDO",
            Command::FindDdo(_) => "findDDO",
            Command::FindProviders(_) => "findProviders",
            Command::FileInfo(_) => "fileInfo",
            Command::GetComputeEnvironments(_) => "getComputeEnvironments",
            Command::FreeStartCompute(_) => "freeStartCompute",
            Command::GetComputeStatus(_) => "getComputeStatus",
            Command::GetComputeResult(_) => "getComputeResult",
            Command::StopCompute(_) => "stopCompute",
            Command::GetComputeStreamableLogs(_) => "getComputeStreamableLogs",
        }
    }

    /// Decode a raw command object.
    pub fn decode(bytes: &[u8]) -> NodeResult<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|_| NodeError::BadRequest("Invalid command".to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> NodeResult<Self> {
        let Some(name) = value.get("command").and_then(Value::as_str) else {
            return Err(NodeError::BadRequest("Invalid command".to_string()));
        };
        let Some((_, required)) = REGISTRY.iter().find(|(n, _)| *n == name) else {
            return Err(NodeError::Unimplemented(name.to_string()));
        };
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|p| value.get(*p).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(NodeError::BadRequest(format!(
                "Missing required parameter(s): {}",
                missing.join(", ")
            )));
        }
        serde_json::from_value(value).map_err(|e| NodeError::BadRequest(format!("Invalid parameters: {}", e)))
    }

    async fn run(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        match self {
            Command::Echo(c) => c.handle(ctx).await,
            Command::Status(c) => c.handle(ctx).await,
            Command::Nonce(c) => c.handle(ctx).await,
            Command::GetDdo(c) => c.handle(ctx).await,
            Command::FindDdo(c) => c.handle(ctx).await,
            Command::FindProviders(c) => c.handle(ctx).await,
            Command::FileInfo(c) => c.handle(ctx).await,
            Command::GetComputeEnvironments(c) => c.handle(ctx).await,
            Command::FreeStartCompute(c) => c.handle(ctx).await,
            Command::GetComputeStatus(c) => c.handle(ctx).await,
            Command::GetComputeResult(c) => c.handle(ctx).await,
            Command::StopCompute(c) => c.handle(ctx).await,
            Command::GetComputeStreamableLogs(c) => c.handle(ctx).await,
        }
    }
}

/// Entry point for inbound network commands and in-process calls.
pub struct Dispatcher {
    ctx: Arc<NodeContext>,
    limits: RequestLimits,
}

impl Dispatcher {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let limits = RequestLimits::new(&ctx.config.security);
        Self { ctx, limits }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Handle the raw first message of an inbound stream from `caller`.
    pub async fn dispatch_bytes(&self, caller: &str, bytes: &[u8]) -> CommandResponse {
        match self.limits.admit(caller) {
            Admission::Allowed => {}
            Admission::Denied => {
                warn!(%caller, "Request denied (caller on deny list)");
                return CommandResponse::error(403, "Forbidden");
            }
            Admission::RateLimited => {
                warn!(%caller, "Request denied (rate limit exceeded)");
                return CommandResponse::error(403, "Rate limit exceeded");
            }
        }
        match Command::decode(bytes) {
            Ok(command) => {
                debug!(%caller, command = command.name(), "Inbound command");
                self.dispatch_direct(command).await
            }
            Err(e) => {
                debug!(%caller, error = %e, "Rejected inbound command");
                CommandResponse::from_error(&e)
            }
        }
    }

    /// Run a command in-process, bypassing the network and admission checks.
    pub async fn dispatch_direct(&self, command: Command) -> CommandResponse {
        let name = command.name();
        match command.run(&self.ctx).await {
            Ok(response) => response,
            Err(e) => {
                debug!(command = name, error = %e, "Command failed");
                CommandResponse::from_error(&e)
            }
        }
    }

    /// Decode and run a command object in-process.
    pub async fn dispatch_value(&self, value: Value) -> CommandResponse {
        match Command::from_value(value) {
            Ok(command) => self.dispatch_direct(command).await,
            Err(e) => CommandResponse::from_error(&e),
        }
    }

    /// Run `command` on `peer_id`. A node cannot dial itself, so commands
    /// addressed here are dispatched directly. Transport failures come back
    /// as statuses.
    pub async fn send_to(&self, peer_id: &str, command: Value) -> CommandResponse {
        let transport = &self.ctx.transport;
        if transport.is_target_peer_self(peer_id) {
            return self.dispatch_value(command).await;
        }
        let payload = match serde_json::to_vec(&command) {
            Ok(payload) => payload,
            Err(e) => return CommandResponse::from_error(&e.into()),
        };
        match transport.send_to(peer_id, payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%peer_id, error = %e, "Sending command failed");
                CommandResponse::from_error(&e)
            }
        }
    }
}
