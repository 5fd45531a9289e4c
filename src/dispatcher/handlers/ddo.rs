use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::NodeContext;
use crate::ddo::validate_ddo_identifier;
use crate::dispatcher::{CommandHandler, CommandResponse};
use crate::error::{NodeError, NodeResult};

/// Full DDO from this node's own store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDdoCommand {
    pub id: String,
}

#[async_trait]
impl CommandHandler for GetDdoCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        validate_ddo_identifier(&self.id)?;
        match ctx.store.retrieve(&self.id)? {
            Some(doc) => CommandResponse::json(&doc),
            None => Ok(CommandResponse::error(404, "Not found")),
        }
    }
}

/// Update records for a DDO across the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindDdoCommand {
    pub id: String,
    /// Skip the cache and query providers again
    #[serde(default)]
    pub force: bool,
}

#[async_trait]
impl CommandHandler for FindDdoCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        validate_ddo_identifier(&self.id)?;
        let results = if self.force {
            ctx.resolver.refresh_ddo(&self.id).await
        } else {
            ctx.resolver.find_ddo(&self.id).await
        };
        debug!(id = %self.id, force = self.force, found = results.len(), "findDDO answered");
        CommandResponse::json(&results)
    }
}

/// Peers advertising a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindProvidersCommand {
    pub id: String,
}

#[async_trait]
impl CommandHandler for FindProvidersCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        if self.id.is_empty() {
            return Err(NodeError::BadRequest("Missing required parameter(s): id".to_string()));
        }
        let timeout = std::time::Duration::from_millis(ctx.config.p2p.find_providers_timeout_ms);
        let providers = ctx.router.find_providers(&self.id, timeout).await?;
        CommandResponse::json(&providers)
    }
}
