use anyhow::{Context, Result};
use std::sync::Arc;
use term_commander::config::{Config, TransportMode};
use term_commander::ToolHandler;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("term_commander={}", level)));

    // stdout carries the stdio transport, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn serve(handler: ToolHandler, config: &Config) -> Result<()> {
    match config.transport_mode {
        #[cfg(feature = "stdio")]
        TransportMode::Stdio => {
            tracing::info!("Using STDIO transport mode.");
            tokio::select! {
                result = term_commander::transport::stdio::run(handler) => result,
                _ = shutdown_signal() => Ok(()),
            }
        }
        #[cfg(feature = "http")]
        TransportMode::Http => {
            tracing::info!(host = %config.http_host, port = %config.http_port, "Using HTTP transport mode.");
            term_commander::transport::http::run(handler, &config.http_host, config.http_port, shutdown_signal()).await
        }
        #[allow(unreachable_patterns)]
        _ => {
            anyhow::bail!(
                "Selected transport mode {:?} is not available in this build.",
                config.transport_mode
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load().context("Failed to load configuration")?);
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting term-commander server");
    tracing::debug!("Loaded configuration: {:?}", config);

    if which::which(&config.default_shell).is_err() {
        tracing::warn!(shell = %config.default_shell, "Default shell not found in PATH. execute_command will fail unless a shell is given per call.");
    }

    let handler = ToolHandler::new(config.clone())
        .await
        .context("Failed to initialise tool handler")?;

    let result = serve(handler.clone(), &config).await;
    handler.shutdown().await;

    tracing::info!("Server shutdown.");
    result
}
