use crate::api::{ToolDefinition, ToolHandler};
use crate::error::AppError;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// `AppError` rendered as an HTTP error body.
#[derive(Debug)]
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::InvalidArgument(_) | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
        AppError::CommandBlocked(_) | AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        AppError::NotFound(_) | AppError::UnknownTool(_) => StatusCode::NOT_FOUND,
        AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status_for(&self.0), Json(body)).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn list_tools(State(handler): State<ToolHandler>) -> Json<Vec<ToolDefinition>> {
    Json(handler.list_tools())
}

async fn call_tool(
    State(handler): State<ToolHandler>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let arguments = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::InvalidArgument(format!("Invalid JSON body: {}", e)))?
    };
    Ok(Json(handler.call_tool(&name, arguments).await?))
}

pub fn router(handler: ToolHandler) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/tools/:name", post(call_tool))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(handler)
}

pub async fn run<F>(handler: ToolHandler, host: &str, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid HTTP_HOST/HTTP_PORT")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router(handler))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    Ok(())
}
