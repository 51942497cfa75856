pub mod api;
pub mod config;
pub mod error;
pub mod session;
pub mod tools;
pub mod transport;
pub mod utils;

pub use api::ToolHandler;
pub use config::Config;
pub use error::AppError;
