use crate::config::Config;
use crate::error::AppError;
use crate::session::BlocklistStore;
use std::sync::Arc;
use tracing::instrument;

/// Read-only view of the running configuration. Configuration is changed
/// through the environment, not through tools.
#[derive(Debug)]
pub struct ConfigTool {
    config: Arc<Config>,
    blocklist: Arc<BlocklistStore>,
}

impl ConfigTool {
    pub fn new(config: Arc<Config>, blocklist: Arc<BlocklistStore>) -> Self {
        Self { config, blocklist }
    }

    /// The loaded configuration, with `blockedCommands` reflecting the live blocklist.
    #[instrument(skip(self))]
    pub async fn get_config(&self) -> Result<Config, AppError> {
        let mut snapshot = self.config.as_ref().clone();
        snapshot.blocked_commands = self.blocklist.list();
        Ok(snapshot)
    }
}
