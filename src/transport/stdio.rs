use crate::api::ToolHandler;
use crate::error::AppError;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug)]
struct RpcFailure {
    code: i64,
    message: String,
    kind: &'static str,
}

impl From<AppError> for RpcFailure {
    fn from(err: AppError) -> Self {
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl RpcFailure {
    fn new(code: i64, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            kind,
        }
    }
}

fn server_details(requested_version: Option<&str>) -> Value {
    json!({
        "protocolVersion": requested_version.unwrap_or(PROTOCOL_VERSION),
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "instructions": "Terminal session manager. execute_command starts a command in the background and returns a session handle in `pid`; \
            poll it with read_output until the status is no longer `running`, stop it with force_terminate. \
            kill_process takes an operating system pid instead. Use block_command/unblock_command to manage forbidden commands."
    })
}

/// Wraps a tool result the way tool-calling clients expect it.
fn tool_call_result(value: Value) -> Value {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": value,
        "isError": false
    })
}

async fn dispatch(handler: &ToolHandler, request: RpcRequest) -> Result<Value, RpcFailure> {
    match request.method.as_str() {
        "initialize" => Ok(server_details(
            request.params.get("protocolVersion").and_then(Value::as_str),
        )),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": handler.list_tools() })),
        "tools/call" => {
            let params: CallToolParams = serde_json::from_value(request.params)
                .map_err(|e| RpcFailure::from(AppError::InvalidArgument(e.to_string())))?;
            let value = handler.call_tool(&params.name, params.arguments).await?;
            Ok(tool_call_result(value))
        }
        other => Err(RpcFailure::new(
            METHOD_NOT_FOUND,
            "MethodNotFound",
            format!("Method not found: {}", other),
        )),
    }
}

fn error_response(id: Value, failure: RpcFailure) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": failure.code,
            "message": failure.message,
            "data": { "kind": failure.kind }
        }
    })
}

/// Handles one input line. Returns `None` for notifications.
async fn handle_line(handler: &ToolHandler, line: &str) -> Option<Value> {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Unparseable JSON-RPC message");
            return Some(error_response(
                Value::Null,
                RpcFailure::new(PARSE_ERROR, "ParseError", format!("Parse error: {}", e)),
            ));
        }
    };
    let Some(id) = request.id.clone() else {
        debug!(method = %request.method, "Ignoring notification");
        return None;
    };
    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return Some(error_response(
            id,
            RpcFailure::new(INVALID_REQUEST, "InvalidRequest", "Only JSON-RPC 2.0 is supported"),
        ));
    }

    Some(match dispatch(handler, request).await {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(failure) => error_response(id, failure),
    })
}

/// Serves newline-delimited JSON-RPC from `reader` until end of input. Requests
/// run concurrently; a single task owns `writer`, which is returned at the end.
pub async fn serve<R, W>(handler: ToolHandler, reader: R, writer: W) -> Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let mut line = serde_json::to_vec(&message)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        Ok::<W, anyhow::Error>(writer)
    });

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handle_line(&handler, &line).await {
                if tx.send(response).is_err() {
                    warn!("Response dropped, output closed");
                }
            }
        });
    }
    debug!("Input closed, waiting for in-flight requests");
    drop(tx);
    writer_task.await?
}

pub async fn run(handler: ToolHandler) -> Result<()> {
    info!("Serving JSON-RPC over stdio");
    serve(handler, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
    Ok(())
}
