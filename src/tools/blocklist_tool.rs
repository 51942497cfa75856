use crate::error::AppError;
use crate::session::BlocklistStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct BlockCommandParams {
    pub command: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistChangeResult {
    /// The command name the request was reduced to.
    pub command: String,
    pub blocked: bool,
    pub blocked_commands: Vec<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBlockedCommandsResult {
    pub blocked_commands: Vec<String>,
}

#[derive(Debug)]
pub struct BlocklistManager {
    store: Arc<BlocklistStore>,
}

impl BlocklistManager {
    pub fn new(store: Arc<BlocklistStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, params), fields(command = %params.command))]
    pub async fn block_command(&self, params: &BlockCommandParams) -> Result<BlocklistChangeResult, AppError> {
        let token = self.store.block(&params.command).await?;
        Ok(BlocklistChangeResult {
            message: format!("'{}' is now blocked. Running sessions are not affected.", token),
            command: token,
            blocked: true,
            blocked_commands: self.store.list(),
        })
    }

    #[instrument(skip(self, params), fields(command = %params.command))]
    pub async fn unblock_command(&self, params: &BlockCommandParams) -> Result<BlocklistChangeResult, AppError> {
        let token = self.store.unblock(&params.command).await?;
        Ok(BlocklistChangeResult {
            message: format!("'{}' is not blocked.", token),
            command: token,
            blocked: false,
            blocked_commands: self.store.list(),
        })
    }

    #[instrument(skip(self))]
    pub async fn list_blocked_commands(&self) -> Result<ListBlockedCommandsResult, AppError> {
        Ok(ListBlockedCommandsResult {
            blocked_commands: self.store.list(),
        })
    }
}
