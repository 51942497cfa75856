use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as TokioMutex;
use tracing::error;

const MAX_LOGGED_STRING_BYTES: usize = 1024;

/// Appends one line per tool call to a size-rotated file.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
    write_lock: TokioMutex<()>,
}

impl AuditLogger {
    pub fn new(log_file_path: PathBuf, max_size_bytes: u64) -> Self {
        // Ensure log directory exists
        if let Some(parent_dir) = log_file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
            write_lock: TokioMutex::new(()),
        }
    }

    /// `None` when no audit log file is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .audit_log_file
            .clone()
            .map(|path| Self::new(path, config.audit_log_max_size_bytes))
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        let metadata = match fs::metadata(&self.log_file_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let backup_file_name = match self.log_file_path.extension() {
                Some(ext) => format!("{}_{}.{}", file_stem, timestamp, ext.to_string_lossy()),
                None => format!("{}_{}", file_stem, timestamp),
            };
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn log_tool_call(&self, tool_name: &str, outcome: &str, arguments: &Value) {
        if let Err(e) = self.try_log_tool_call(tool_name, outcome, arguments).await {
            error!(tool = %tool_name, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_tool_call(&self, tool_name: &str, outcome: &str, arguments: &Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        let args_string = serde_json::to_string(&sanitize_arguments(arguments))?;
        let log_entry = format!("{} | {:<22} | {:<16} | {}\n", timestamp, tool_name, outcome, args_string);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

/// Truncates oversized string arguments (e.g. long command lines).
fn sanitize_arguments(arguments: &Value) -> Value {
    let mut sanitized = arguments.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for value in obj.values_mut() {
            if let Value::String(s) = value {
                if s.len() > MAX_LOGGED_STRING_BYTES {
                    let mut cut = MAX_LOGGED_STRING_BYTES;
                    while !s.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    *value = Value::String(format!("{}<truncated {} bytes>", &s[..cut], s.len() - cut));
                }
            }
        }
    }
    sanitized
}
