pub mod handler;
pub mod schemas;

pub use handler::ToolHandler;
pub use schemas::ToolDefinition;
