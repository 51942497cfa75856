use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for session {session}: {from} -> {to}")]
    InvalidTransition {
        session: String,
        from: String,
        to: String,
    },

    #[error("Failed to spawn command: {0}")]
    SpawnFailure(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Serde JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocklist persistence error: {0}")]
    Persistence(String),
}

impl AppError {
    /// Stable name of the error class, surfaced to callers as `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidArgument(_) => "InvalidArgument",
            AppError::CommandBlocked(_) => "CommandBlocked",
            AppError::NotFound(_) => "NotFound",
            AppError::InvalidTransition { .. } => "InvalidTransition",
            AppError::SpawnFailure(_) => "SpawnFailure",
            AppError::PermissionDenied(_) => "PermissionDenied",
            AppError::UnknownTool(_) => "UnknownTool",
            AppError::Io(_) => "Io",
            AppError::Config(_) => "Config",
            AppError::Serialization(_) => "Serialization",
            AppError::Persistence(_) => "Persistence",
        }
    }

    /// JSON-RPC error code used by the stdio transport.
    pub fn rpc_code(&self) -> i64 {
        match self {
            AppError::InvalidArgument(_) | AppError::Serialization(_) => -32602,
            AppError::CommandBlocked(_) => -32001, // Custom server error for blocked
            AppError::PermissionDenied(_) => -32003,
            AppError::NotFound(_) => -32004,
            AppError::InvalidTransition { .. } => -32009,
            AppError::UnknownTool(_) => -32601,
            _ => -32603,
        }
    }

    /// Whether the error was caused by the request rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidArgument(_)
                | AppError::CommandBlocked(_)
                | AppError::NotFound(_)
                | AppError::InvalidTransition { .. }
                | AppError::PermissionDenied(_)
                | AppError::UnknownTool(_)
                | AppError::Serialization(_)
        )
    }
}
