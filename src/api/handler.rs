use crate::api::schemas::{tool_definitions, ToolDefinition};
use crate::config::Config;
use crate::error::AppError;
use crate::session::{BlocklistBackend, BlocklistStore, JsonFileBackend, MemoryBackend};
use crate::tools::{
    blocklist_tool::{BlockCommandParams, BlocklistManager},
    config_tool::ConfigTool,
    process_tool::{KillProcessParams, ProcessManager},
    terminal_tool::{ExecuteCommandParams, ForceTerminateParams, ReadOutputParams, TerminalManager},
};
use crate::utils::audit_logger::AuditLogger;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

// Every manager, built once from the loaded config
#[derive(Debug)]
pub struct AppManagers {
    terminal_manager: Arc<TerminalManager>,
    process_manager: Arc<ProcessManager>,
    blocklist_manager: Arc<BlocklistManager>,
    config_tool: Arc<ConfigTool>,
}

impl AppManagers {
    pub async fn new(config: Arc<Config>) -> Result<Self, AppError> {
        let backend: Arc<dyn BlocklistBackend> = match &config.blocklist_file {
            Some(path) => Arc::new(JsonFileBackend::new(path)),
            None => Arc::new(MemoryBackend),
        };
        let blocklist = Arc::new(BlocklistStore::open(backend, &config.blocked_commands).await?);

        let terminal_manager = Arc::new(TerminalManager::new(&config, blocklist.clone()));
        let process_manager = Arc::new(ProcessManager::new(terminal_manager.terminator().clone()));
        let blocklist_manager = Arc::new(BlocklistManager::new(blocklist.clone()));
        let config_tool = Arc::new(ConfigTool::new(config, blocklist));

        Ok(Self {
            terminal_manager,
            process_manager,
            blocklist_manager,
            config_tool,
        })
    }
}

/// Transport-independent tool surface: lists tools, dispatches calls and
/// audits them.
#[derive(Debug, Clone)]
pub struct ToolHandler {
    managers: Arc<AppManagers>,
    audit_logger: Option<Arc<AuditLogger>>,
}

impl ToolHandler {
    pub async fn new(config: Arc<Config>) -> Result<Self, AppError> {
        let audit_logger = AuditLogger::from_config(&config).map(Arc::new);
        let managers = Arc::new(AppManagers::new(config).await?);
        managers.terminal_manager.start_sweeper();
        Ok(Self {
            managers,
            audit_logger,
        })
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        tool_definitions()
    }

    #[instrument(skip(self, arguments), fields(tool_name = %name))]
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AppError> {
        info!("Handling call_tool request for: {}", name);
        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let result = self.dispatch(name, &arguments).await;
        if let Some(audit_logger) = &self.audit_logger {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            audit_logger.log_tool_call(name, outcome, &arguments).await;
        }
        match &result {
            Ok(_) => debug!(tool = %name, "Tool call succeeded"),
            Err(e) if e.is_client_error() => debug!(tool = %name, error = %e, "Tool call rejected"),
            Err(e) => error!(tool = %name, error = %e, "Tool call failed"),
        }
        result
    }

    async fn dispatch(&self, name: &str, args: &Value) -> Result<Value, AppError> {
        // Helper macro to parse args and call manager method
        macro_rules! handle_tool {
            ($manager_field:ident . $method:ident :: <$param_type:ty>) => {{
                let params: $param_type = serde_json::from_value(args.clone())
                    .map_err(|e| AppError::InvalidArgument(e.to_string()))?;
                let result = self.managers.$manager_field.$method(&params).await?;
                Ok(serde_json::to_value(result)?)
            }};
            ($manager_field:ident . $method:ident ()) => {{
                let result = self.managers.$manager_field.$method().await?;
                Ok(serde_json::to_value(result)?)
            }};
        }

        match name {
            // Terminal
            "execute_command" => handle_tool!(terminal_manager.execute_command::<ExecuteCommandParams>),
            "read_output" => handle_tool!(terminal_manager.read_output::<ReadOutputParams>),
            "force_terminate" => handle_tool!(terminal_manager.force_terminate::<ForceTerminateParams>),
            "list_sessions" => handle_tool!(terminal_manager.list_sessions()),
            // Process
            "kill_process" => handle_tool!(process_manager.kill_process::<KillProcessParams>),
            "list_processes" => handle_tool!(process_manager.list_processes()),
            // Blocklist
            "block_command" => handle_tool!(blocklist_manager.block_command::<BlockCommandParams>),
            "unblock_command" => handle_tool!(blocklist_manager.unblock_command::<BlockCommandParams>),
            "list_blocked_commands" => handle_tool!(blocklist_manager.list_blocked_commands()),
            // Config
            "get_config" => handle_tool!(config_tool.get_config()),

            _ => {
                error!("Unknown tool called: {}", name);
                Err(AppError::UnknownTool(name.to_string()))
            }
        }
    }

    /// Terminates every running session. Called once when the server stops.
    pub async fn shutdown(&self) {
        self.managers.terminal_manager.shutdown().await;
    }
}
