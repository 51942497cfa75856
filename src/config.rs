use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BLOCKED_COMMANDS: &str = "sudo,su,rm,mkfs,fdisk,dd,reboot,shutdown,poweroff,halt,format,mount,umount,passwd,adduser,useradd,usermod,groupadd";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub files_root: PathBuf,
    pub blocked_commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocklist_file: Option<PathBuf>,
    pub default_shell: String,
    pub log_level: String,
    pub transport_mode: TransportMode,
    pub http_host: String,
    pub http_port: u16,
    pub termination_grace_ms: u64,
    pub output_drain_timeout_ms: u64,
    pub session_retention_secs: u64,
    pub drained_session_grace_secs: u64,
    pub sweep_interval_ms: u64,
    pub exit_policy: ExitPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log_file: Option<PathBuf>,
    pub audit_log_max_size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stdio,
    Http,
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "http" => Ok(TransportMode::Http),
            _ => Err(anyhow::anyhow!("Invalid transport mode: {}. Valid options are 'stdio', 'http'.", s)),
        }
    }
}

/// How a process that exits on its own with a non-zero code is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Non-zero or signal-terminated exits are recorded as `failed`.
    Failed,
    /// Every natural exit is `completed`; the exit code is informational only.
    Informational,
}

impl FromStr for ExitPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "failed" => Ok(ExitPolicy::Failed),
            "informational" => Ok(ExitPolicy::Informational),
            _ => Err(anyhow::anyhow!("Invalid exit policy: {}. Valid options are 'failed', 'informational'.", s)),
        }
    }
}

pub fn expand_tilde(path_str: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

pub fn platform_default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

pub fn parse_command_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            files_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            blocked_commands: parse_command_list(DEFAULT_BLOCKED_COMMANDS),
            blocklist_file: None,
            default_shell: platform_default_shell(),
            log_level: "info".to_string(),
            transport_mode: TransportMode::Stdio,
            http_host: "127.0.0.1".to_string(),
            http_port: 3000,
            termination_grace_ms: 2000,
            output_drain_timeout_ms: 1000,
            session_retention_secs: 600,
            drained_session_grace_secs: 30,
            sweep_interval_ms: 5000,
            exit_policy: ExitPolicy::Failed,
            audit_log_file: None,
            audit_log_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let files_root = match get("FILES_ROOT") {
            Some(root) => {
                let expanded = expand_tilde(&root)?;
                dunce::canonicalize(&expanded)
                    .context(format!("Failed to canonicalize FILES_ROOT: {}", root))?
            }
            None => defaults.files_root.clone(),
        };
        if !files_root.is_dir() {
            anyhow::bail!("FILES_ROOT is not a valid directory: {:?}", files_root);
        }

        let blocked_commands = match lookup("BLOCKED_COMMANDS") {
            Some(list) => parse_command_list(&list),
            None => defaults.blocked_commands.clone(),
        };

        let blocklist_file = get("BLOCKLIST_FILE").map(|p| expand_tilde(&p)).transpose()?;

        let default_shell = get("DEFAULT_SHELL").unwrap_or(defaults.default_shell);
        let log_level = get("LOG_LEVEL").unwrap_or(defaults.log_level);

        let transport_mode = match get("TRANSPORT") {
            Some(mode) => TransportMode::from_str(&mode)?,
            None => defaults.transport_mode,
        };
        let http_host = get("HTTP_HOST").unwrap_or(defaults.http_host);
        let http_port = parse_or("HTTP_PORT", get("HTTP_PORT"), defaults.http_port)?;

        let termination_grace_ms = parse_or("TERMINATION_GRACE_MS", get("TERMINATION_GRACE_MS"), defaults.termination_grace_ms)?;
        let output_drain_timeout_ms = parse_or("OUTPUT_DRAIN_TIMEOUT_MS", get("OUTPUT_DRAIN_TIMEOUT_MS"), defaults.output_drain_timeout_ms)?;
        let session_retention_secs = parse_or("SESSION_RETENTION_SECS", get("SESSION_RETENTION_SECS"), defaults.session_retention_secs)?;
        let drained_session_grace_secs = parse_or("DRAINED_SESSION_GRACE_SECS", get("DRAINED_SESSION_GRACE_SECS"), defaults.drained_session_grace_secs)?;
        let sweep_interval_ms = parse_or("SWEEP_INTERVAL_MS", get("SWEEP_INTERVAL_MS"), defaults.sweep_interval_ms)?;
        if sweep_interval_ms == 0 {
            anyhow::bail!("SWEEP_INTERVAL_MS must be greater than zero");
        }

        let exit_policy = match get("EXIT_POLICY") {
            Some(policy) => ExitPolicy::from_str(&policy)?,
            None => defaults.exit_policy,
        };

        let audit_log_file = get("AUDIT_LOG_FILE").map(|p| expand_tilde(&p)).transpose()?;
        let audit_log_max_size_bytes = match get("AUDIT_LOG_MAX_SIZE_MB") {
            Some(mb) => match mb.parse::<u64>().ok().and_then(|n| n.checked_mul(1024 * 1024)) {
                Some(bytes) => bytes,
                None => {
                    warn!(value = %mb, "Invalid AUDIT_LOG_MAX_SIZE_MB, falling back to 10 MB");
                    defaults.audit_log_max_size_bytes
                }
            },
            None => defaults.audit_log_max_size_bytes,
        };

        Ok(Config {
            files_root,
            blocked_commands,
            blocklist_file,
            default_shell,
            log_level,
            transport_mode,
            http_host,
            http_port,
            termination_grace_ms,
            output_drain_timeout_ms,
            session_retention_secs,
            drained_session_grace_secs,
            sweep_interval_ms,
            exit_policy,
            audit_log_file,
            audit_log_max_size_bytes,
        })
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn drained_session_grace(&self) -> Duration {
        Duration::from_secs(self.drained_session_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw.parse::<T>().context(format!("Invalid {}", key)),
        None => Ok(default),
    }
}
