use super::handle::{GenerationCounter, SessionId};
use super::{SessionStatus, StopIntent};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as TokioMutex, Notify, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct SessionRecord {
    pub(crate) id: SessionId,
    pub(crate) command: String,
    pub(crate) shell: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started: Instant,
    pub(crate) status: SessionStatus,
    pub(crate) exit_code: Option<i32>,
    pub(crate) output: Vec<u8>,
    pub(crate) read_cursor: usize,
    pub(crate) timeout_deadline: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<Instant>,
    pub(crate) finished_at_wall: Option<DateTime<Utc>>,
    pub(crate) drained_at: Option<Instant>,
    pub(crate) stop_intent: Option<StopIntent>,
    pub(crate) error: Option<String>,
}

impl SessionRecord {
    fn snapshot(&self) -> SessionInfo {
        let runtime = match self.finished_at {
            Some(finished) => finished.duration_since(self.started),
            None => self.started.elapsed(),
        };
        SessionInfo {
            pid: self.id,
            os_pid: self.id.os_pid(),
            command: self.command.clone(),
            shell: self.shell.clone(),
            status: self.status,
            exit_code: self.exit_code,
            start_time_iso: self.created_at.to_rfc3339(),
            end_time_iso: self.finished_at_wall.map(|t| t.to_rfc3339()),
            runtime_ms: runtime.as_millis() as u64,
            timeout_deadline_iso: self.timeout_deadline.map(|t| t.to_rfc3339()),
            output_bytes: self.output.len(),
            unread_bytes: self.output.len() - self.read_cursor,
            stop_requested: self.stop_intent,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a session, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub pid: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_pid: Option<u32>,
    pub command: String,
    pub shell: String,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub start_time_iso: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_iso: Option<String>,
    pub runtime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_deadline_iso: Option<String>,
    pub output_bytes: usize,
    pub unread_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_requested: Option<StopIntent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// When finished sessions leave the registry.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// Retention after a caller has read the last output along with the terminal status.
    pub drained_grace: Duration,
    /// Upper bound on retention of any terminal session.
    pub retention: Duration,
}

impl EvictionPolicy {
    fn is_expired(&self, record: &SessionRecord, now: Instant) -> bool {
        let Some(finished) = record.finished_at else {
            return false;
        };
        if now.duration_since(finished) >= self.retention {
            return true;
        }
        record
            .drained_at
            .is_some_and(|drained| now.duration_since(drained) >= self.drained_grace)
    }
}

#[derive(Debug)]
pub(crate) struct SessionSlot {
    record: TokioMutex<SessionRecord>,
    status_tx: watch::Sender<SessionStatus>,
    stop: Arc<Notify>,
}

/// Authoritative map of sessions. Each record has its own lock, so writers to
/// one session never block readers of another.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: TokioRwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    generations: GenerationCounter,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        command: &str,
        shell: &str,
        timeout: Option<Duration>,
        os_pid: Option<u32>,
    ) -> Result<SessionId, AppError> {
        if command.trim().is_empty() {
            return Err(AppError::InvalidArgument("command must not be empty".to_string()));
        }

        let id = SessionId::new(self.generations.next(), os_pid);
        let created_at = Utc::now();
        let timeout_deadline = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|t| created_at.checked_add_signed(t));

        let record = SessionRecord {
            id,
            command: command.to_string(),
            shell: shell.to_string(),
            created_at,
            started: Instant::now(),
            status: SessionStatus::Running,
            exit_code: None,
            output: Vec::new(),
            read_cursor: 0,
            timeout_deadline,
            finished_at: None,
            finished_at_wall: None,
            drained_at: None,
            stop_intent: None,
            error: None,
        };
        let (status_tx, _) = watch::channel(SessionStatus::Running);
        let slot = Arc::new(SessionSlot {
            record: TokioMutex::new(record),
            status_tx,
            stop: Arc::new(Notify::new()),
        });

        self.sessions.write().await.insert(id, slot);
        debug!(sid = %id, os_pid = ?os_pid, command = %command, "Session registered");
        Ok(id)
    }

    async fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>, AppError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {}", id)))
    }

    /// Runs `f` with exclusive access to one record.
    pub(crate) async fn with_record<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<R, AppError> {
        let slot = self.slot(id).await?;
        let mut record = slot.record.lock().await;
        Ok(f(&mut record))
    }

    pub async fn get(&self, id: SessionId) -> Result<SessionInfo, AppError> {
        self.with_record(id, |record| record.snapshot()).await
    }

    /// Every running session plus terminal sessions that have not been evicted yet.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let slots: Vec<Arc<SessionSlot>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(slots.len());
        for slot in slots {
            infos.push(slot.record.lock().await.snapshot());
        }
        infos.sort_by_key(|info| info.pid.generation());
        infos
    }

    pub async fn running_ids(&self) -> Vec<SessionId> {
        self.list()
            .await
            .into_iter()
            .filter(|info| info.status == SessionStatus::Running)
            .map(|info| info.pid)
            .collect()
    }

    pub async fn transition(
        &self,
        id: SessionId,
        new_status: SessionStatus,
        exit_code: Option<i32>,
    ) -> Result<SessionInfo, AppError> {
        let slot = self.slot(id).await?;
        let mut record = slot.record.lock().await;
        if !record.status.can_transition_to(new_status) {
            return Err(AppError::InvalidTransition {
                session: id.to_string(),
                from: record.status.to_string(),
                to: new_status.to_string(),
            });
        }
        record.status = new_status;
        record.exit_code = exit_code;
        record.finished_at = Some(Instant::now());
        record.finished_at_wall = Some(Utc::now());
        slot.status_tx.send_replace(new_status);
        info!(sid = %id, status = %new_status, exit_code = ?exit_code, "Session reached terminal state");
        Ok(record.snapshot())
    }

    pub async fn append_output(&self, id: SessionId, chunk: &[u8]) -> Result<(), AppError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.with_record(id, |record| {
            if record.status.is_terminal() {
                warn!(sid = %id, status = %record.status, bytes = chunk.len(), "Dropping output for finished session");
                return;
            }
            record.output.extend_from_slice(chunk);
        })
        .await
    }

    /// Attaches failure detail (e.g. the spawn error) to a running session's record.
    pub async fn record_error(&self, id: SessionId, message: &str) -> Result<(), AppError> {
        self.with_record(id, |record| {
            if record.status.is_terminal() {
                warn!(sid = %id, "Ignoring error detail for finished session");
                return;
            }
            record.error = Some(message.to_string());
            record.output.extend_from_slice(message.as_bytes());
            record.output.push(b'\n');
        })
        .await
    }

    /// Records why a running session should stop and wakes its supervisor.
    /// Returns the effective intent; an earlier intent is never overwritten.
    pub async fn request_stop(&self, id: SessionId, intent: StopIntent) -> Result<StopIntent, AppError> {
        let slot = self.slot(id).await?;
        let effective = {
            let mut record = slot.record.lock().await;
            if record.status.is_terminal() {
                return Err(AppError::InvalidTransition {
                    session: id.to_string(),
                    from: record.status.to_string(),
                    to: SessionStatus::from(intent).to_string(),
                });
            }
            *record.stop_intent.get_or_insert(intent)
        };
        slot.stop.notify_one();
        debug!(sid = %id, intent = ?effective, "Stop requested");
        Ok(effective)
    }

    pub async fn stop_intent(&self, id: SessionId) -> Result<Option<StopIntent>, AppError> {
        self.with_record(id, |record| record.stop_intent).await
    }

    pub(crate) async fn stop_notifier(&self, id: SessionId) -> Result<Arc<Notify>, AppError> {
        Ok(self.slot(id).await?.stop.clone())
    }

    pub async fn subscribe(&self, id: SessionId) -> Result<watch::Receiver<SessionStatus>, AppError> {
        Ok(self.slot(id).await?.status_tx.subscribe())
    }

    /// Waits until the session is terminal or `limit` elapses, then returns its snapshot.
    pub async fn wait_terminal(&self, id: SessionId, limit: Duration) -> Result<SessionInfo, AppError> {
        let mut rx = self.subscribe(id).await?;
        let reached = tokio::time::timeout(limit, rx.wait_for(|status| status.is_terminal()))
            .await
            .is_ok_and(|seen| seen.is_ok());
        if !reached {
            warn!(sid = %id, limit_ms = limit.as_millis() as u64, "Session did not reach a terminal state in time");
        }
        self.get(id).await
    }

    pub async fn evict(&self, id: SessionId) -> Result<(), AppError> {
        let slot = self.slot(id).await?;
        let status = slot.record.lock().await.status;
        if !status.is_terminal() {
            return Err(AppError::InvalidTransition {
                session: id.to_string(),
                from: status.to_string(),
                to: "evicted".to_string(),
            });
        }
        self.sessions.write().await.remove(&id);
        debug!(sid = %id, "Session evicted");
        Ok(())
    }

    /// Removes every terminal session the policy no longer retains.
    pub async fn evict_expired(&self, policy: &EvictionPolicy) -> Vec<SessionId> {
        let now = Instant::now();
        let slots: Vec<(SessionId, Arc<SessionSlot>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, slot) in slots {
            if policy.is_expired(&*slot.record.lock().await, now) {
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &expired {
                sessions.remove(id);
            }
            info!(count = expired.len(), "Evicted expired sessions");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
