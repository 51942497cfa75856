use crate::config::Config;
use crate::error::AppError;
use crate::session::{
    BlocklistStore, EngineSettings, EvictionPolicy, ExecuteRequest, ExecutionEngine, OutputChunk, OutputReader,
    SessionId, SessionInfo, SessionRegistry, SessionStatus, TerminationController,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Deserialize)]
pub struct ExecuteCommandParams {
    pub command: String,
    #[serde(rename = "timeout_ms")]
    pub timeout_ms: Option<u64>,
    pub shell: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadOutputParams {
    #[serde(alias = "session_id")]
    pub pid: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct ForceTerminateParams {
    #[serde(alias = "session_id")]
    pub pid: SessionId,
}

#[derive(Debug, Serialize)]
pub struct ExecuteCommandResult {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ForceTerminateResult {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResult {
    pub sessions: Vec<SessionInfo>,
}

/// Tool-facing front of the session manager. Owns the registry and the
/// background sweeper that evicts finished sessions.
#[derive(Debug)]
pub struct TerminalManager {
    registry: Arc<SessionRegistry>,
    engine: ExecutionEngine,
    reader: OutputReader,
    terminator: Arc<TerminationController>,
    eviction: EvictionPolicy,
    sweep_interval: Duration,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl TerminalManager {
    pub fn new(config: &Config, blocklist: Arc<BlocklistStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let settings = EngineSettings::from_config(config);
        let terminator = Arc::new(TerminationController::new(
            registry.clone(),
            settings.termination_grace,
            settings.output_drain_timeout,
        ));
        Self {
            engine: ExecutionEngine::new(registry.clone(), blocklist, settings),
            reader: OutputReader::new(registry.clone()),
            terminator,
            registry,
            eviction: EvictionPolicy {
                drained_grace: config.drained_session_grace(),
                retention: config.session_retention(),
            },
            sweep_interval: config.sweep_interval(),
            sweeper: StdMutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn terminator(&self) -> &Arc<TerminationController> {
        &self.terminator
    }

    /// Starts the periodic eviction sweep. Must be called inside a tokio runtime;
    /// calling it again is a no-op.
    pub fn start_sweeper(&self) {
        let mut slot = match self.sweeper.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let policy = self.eviction;
        let period = self.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_expired(&policy).await;
                if !evicted.is_empty() {
                    debug!(evicted = ?evicted.iter().map(|id| id.to_string()).collect::<Vec<_>>(), "Sweep evicted sessions");
                }
            }
        }));
        debug!(interval_ms = period.as_millis() as u64, "Session sweeper started");
    }

    #[instrument(skip(self, params), fields(command = %params.command))]
    pub async fn execute_command(&self, params: &ExecuteCommandParams) -> Result<ExecuteCommandResult, AppError> {
        let session = self
            .engine
            .execute(ExecuteRequest {
                command: params.command.clone(),
                timeout: params.timeout_ms.map(Duration::from_millis),
                shell: params.shell.clone(),
            })
            .await?;

        let message = match session.status {
            SessionStatus::Running => format!(
                "Command started with PID {}. Use read_output to poll its output.",
                session.pid
            ),
            status => format!(
                "Command session {} is {}: {}",
                session.pid,
                status,
                session.error.as_deref().unwrap_or("no detail")
            ),
        };
        Ok(ExecuteCommandResult { session, message })
    }

    #[instrument(skip(self, params), fields(pid = %params.pid))]
    pub async fn read_output(&self, params: &ReadOutputParams) -> Result<OutputChunk, AppError> {
        self.reader.read(params.pid).await
    }

    #[instrument(skip(self, params), fields(pid = %params.pid))]
    pub async fn force_terminate(&self, params: &ForceTerminateParams) -> Result<ForceTerminateResult, AppError> {
        let session = self.terminator.force_terminate(params.pid).await?;
        let success = session.status.is_terminal();
        let message = if success {
            format!("Session {} is {}.", session.pid, session.status)
        } else {
            format!(
                "Termination of session {} was requested but it is still running.",
                session.pid
            )
        };
        Ok(ForceTerminateResult {
            session,
            success,
            message,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_sessions(&self) -> Result<ListSessionsResult, AppError> {
        Ok(ListSessionsResult {
            sessions: self.registry.list().await,
        })
    }

    /// Stops the sweeper and force-terminates every running session.
    pub async fn shutdown(&self) {
        let sweeper = match self.sweeper.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let running = self.registry.running_ids().await;
        if running.is_empty() {
            return;
        }
        info!(count = running.len(), "Terminating running sessions");
        let mut stops = JoinSet::new();
        for id in running {
            let terminator = self.terminator.clone();
            stops.spawn(async move { (id, terminator.force_terminate(id).await) });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((id, Err(e))) => warn!(sid = %id, error = %e, "Failed to terminate session on shutdown"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Termination task panicked"),
            }
        }
    }
}
