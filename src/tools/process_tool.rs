use crate::error::AppError;
use crate::session::{KillOutcome, TerminationController};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use sysinfo::System;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
pub struct KillProcessParams {
    pub pid: u32, // raw OS pid, not a session handle
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pid: u32,
    name: String,
    cpu_usage: f32,
    memory_mb: u64,
    command: String,
    status: String, // e.g. Run, Sleep
    user: Option<String>,
    start_time_epoch_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ListProcessesResult {
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Serialize)]
pub struct KillProcessResult {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: KillOutcome,
}

#[derive(Debug)]
pub struct ProcessManager {
    terminator: Arc<TerminationController>,
    system: Arc<StdMutex<System>>, // sysinfo is sync
}

impl ProcessManager {
    pub fn new(terminator: Arc<TerminationController>) -> Self {
        Self {
            terminator,
            system: Arc::new(StdMutex::new(System::new())),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_processes(&self) -> Result<ListProcessesResult, AppError> {
        let mut sys_guard = self
            .system
            .lock()
            .map_err(|e| AppError::Persistence(format!("Failed to lock process table: {}", e)))?;
        sys_guard.refresh_processes();
        debug!("Listing system processes. Found {} processes.", sys_guard.processes().len());

        let mut processes: Vec<ProcessInfo> = sys_guard
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024), // Bytes to MB
                command: process.cmd().join(" "),
                status: process.status().to_string(),
                user: process.user_id().map(|uid| format!("{:?}", uid)),
                start_time_epoch_secs: process.start_time(),
            })
            .collect();
        processes.sort_by_key(|p| p.pid);
        Ok(ListProcessesResult { processes })
    }

    #[instrument(skip(self, params), fields(pid = %params.pid))]
    pub async fn kill_process(&self, params: &KillProcessParams) -> Result<KillProcessResult, AppError> {
        let outcome = self.terminator.kill_process(params.pid).await?;
        Ok(KillProcessResult {
            success: outcome.terminated,
            outcome,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use std::time::Duration;

    fn manager() -> ProcessManager {
        let terminator = TerminationController::new(
            Arc::new(SessionRegistry::new()),
            Duration::from_millis(500),
            Duration::from_millis(200),
        );
        ProcessManager::new(Arc::new(terminator))
    }

    #[tokio::test]
    async fn test_list_includes_current_process() {
        let listed = manager().list_processes().await.unwrap();
        let me = std::process::id();
        assert!(listed.processes.iter().any(|p| p.pid == me));
        assert!(listed.processes.windows(2).all(|w| w[0].pid <= w[1].pid));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_process_reports_success() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let waiter = tokio::spawn(async move { child.wait().await });

        let result = manager().kill_process(&KillProcessParams { pid }).await.unwrap();
        assert!(result.success);
        assert_eq!(result.outcome.signal, "SIGTERM");
        waiter.await.unwrap().unwrap();
    }
}
