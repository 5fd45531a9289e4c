use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::NodeContext;
use crate::dispatcher::{CommandHandler, CommandResponse};
use crate::error::NodeResult;
use crate::storage::FileObject;
use crate::stream;

/// Liveness check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoCommand {}

#[async_trait]
impl CommandHandler for EchoCommand {
    async fn handle(self, _ctx: &NodeContext) -> NodeResult<CommandResponse> {
        Ok(CommandResponse::ok(stream::once("OK")))
    }
}

/// Metadata of a file reference, optionally with a full-content checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfoCommand {
    #[serde(flatten)]
    pub file: FileObject,
    #[serde(default)]
    pub checksum: bool,
}

#[async_trait]
impl CommandHandler for FileInfoCommand {
    async fn handle(self, ctx: &NodeContext) -> NodeResult<CommandResponse> {
        ctx.storage.validate(&self.file)?;
        let info = ctx.storage.file_info(&self.file, self.checksum).await?;
        CommandResponse::json(&vec![info])
    }
}
