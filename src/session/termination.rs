use super::handle::SessionId;
use super::registry::{SessionInfo, SessionRegistry};
use super::StopIntent;
use crate::error::AppError;
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::process::Child;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const FORCED_EXIT_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn as_raw(&self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Sends `signal` to a pid (or, with a negative target, a process group).
#[cfg(unix)]
fn send_raw(target: libc::pid_t, signal: Signal) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(target, signal.as_raw()) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Signals every process in the group led by `leader`. A group that is already
/// gone is not an error.
#[cfg(unix)]
pub(crate) fn signal_group(leader: u32, signal: Signal) -> std::io::Result<()> {
    let pgid: libc::pid_t = leader
        .try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "PID out of range"))?;
    match send_raw(-pgid, signal) {
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        other => other,
    }
}

/// Asks a session's process to stop: SIGTERM to its process group, then
/// SIGKILL if it has not exited within `grace`. Returns the exit status.
pub(crate) async fn stop_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    let leader = child.id();
    request_graceful_stop(child, leader)?;

    let status = match timeout(grace, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            warn!(pid = ?leader, grace_ms = grace.as_millis() as u64, "Process ignored graceful stop, escalating");
            force_stop(child, leader)?;
            child.wait().await?
        }
    };

    sweep_group(leader);
    Ok(status)
}

/// Kills anything the shell left behind in its group.
#[cfg(unix)]
pub(crate) fn sweep_group(leader: Option<u32>) {
    if let Some(leader) = leader {
        if let Err(e) = signal_group(leader, Signal::Kill) {
            debug!(pid = leader, error = %e, "Process group sweep failed");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn sweep_group(_leader: Option<u32>) {}

#[cfg(unix)]
fn request_graceful_stop(_child: &mut Child, leader: Option<u32>) -> std::io::Result<()> {
    match leader {
        Some(leader) => signal_group(leader, Signal::Term),
        None => Ok(()), // already reaped
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child, _leader: Option<u32>) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(unix)]
fn force_stop(child: &mut Child, leader: Option<u32>) -> std::io::Result<()> {
    match leader {
        Some(leader) => signal_group(leader, Signal::Kill),
        None => child.start_kill(),
    }
}

#[cfg(not(unix))]
fn force_stop(child: &mut Child, _leader: Option<u32>) -> std::io::Result<()> {
    child.start_kill()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillOutcome {
    pub pid: u32,
    pub name: String,
    /// Strongest signal that had to be sent.
    pub signal: &'static str,
    pub terminated: bool,
    pub message: String,
}

/// Stops sessions through the registry, and arbitrary OS processes directly.
#[derive(Debug)]
pub struct TerminationController {
    registry: Arc<SessionRegistry>,
    grace: Duration,
    drain_timeout: Duration,
    system: Arc<StdMutex<System>>, // sysinfo is sync
}

impl TerminationController {
    pub fn new(registry: Arc<SessionRegistry>, grace: Duration, drain_timeout: Duration) -> Self {
        Self {
            registry,
            grace,
            drain_timeout,
            system: Arc::new(StdMutex::new(System::new())),
        }
    }

    /// Requests termination of a running session and waits (bounded) for the
    /// supervisor to record the terminal state.
    #[instrument(skip(self), fields(sid = %id))]
    pub async fn force_terminate(&self, id: SessionId) -> Result<SessionInfo, AppError> {
        let intent = self.registry.request_stop(id, StopIntent::Terminate).await?;
        info!(sid = %id, intent = ?intent, "Termination requested");
        let limit = self.grace + FORCED_EXIT_WAIT + self.drain_timeout + FORCED_EXIT_WAIT;
        self.registry.wait_terminal(id, limit).await
    }

    /// Stops an OS process that is not necessarily a session. Registry state is
    /// never touched.
    #[instrument(skip(self))]
    pub async fn kill_process(&self, pid: u32) -> Result<KillOutcome, AppError> {
        if pid == 0 {
            return Err(AppError::InvalidArgument("pid must be a positive process id".to_string()));
        }
        if pid == std::process::id() {
            return Err(AppError::InvalidArgument("refusing to kill the server's own process".to_string()));
        }

        let name = self
            .process_name(pid)?
            .ok_or_else(|| AppError::NotFound(format!("process {}", pid)))?;
        debug!(pid, name = %name, "Attempting to stop process");

        self.send(pid, Signal::Term)?;
        if self.wait_gone(pid, self.grace).await? {
            info!(pid, name = %name, "Process terminated with SIGTERM");
            return Ok(KillOutcome {
                pid,
                message: format!("Process {} ({}) terminated with SIGTERM.", pid, name),
                name,
                signal: Signal::Term.name(),
                terminated: true,
            });
        }

        warn!(pid, name = %name, "Process did not terminate with SIGTERM, trying SIGKILL");
        self.send(pid, Signal::Kill)?;
        let terminated = self.wait_gone(pid, FORCED_EXIT_WAIT).await?;
        let message = if terminated {
            format!("Process {} ({}) terminated with SIGKILL.", pid, name)
        } else {
            format!("Sent SIGKILL to process {} ({}), but it is still running.", pid, name)
        };
        Ok(KillOutcome {
            pid,
            name,
            signal: Signal::Kill.name(),
            terminated,
            message,
        })
    }

    fn lock_system(&self) -> Result<std::sync::MutexGuard<'_, System>, AppError> {
        self.system
            .lock()
            .map_err(|e| AppError::Persistence(format!("process table lock poisoned: {}", e)))
    }

    /// Name of a live (non-zombie) process, refreshed from the OS.
    fn process_name(&self, pid: u32) -> Result<Option<String>, AppError> {
        let mut sys = self.lock_system()?;
        let sys_pid = Pid::from_u32(pid);
        if !sys.refresh_process(sys_pid) {
            return Ok(None);
        }
        Ok(sys
            .process(sys_pid)
            .filter(|p| p.status() != ProcessStatus::Zombie)
            .map(|p| p.name().to_string()))
    }

    async fn wait_gone(&self, pid: u32, limit: Duration) -> Result<bool, AppError> {
        let deadline = Instant::now() + limit;
        loop {
            if self.process_name(pid)?.is_none() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    fn send(&self, pid: u32, signal: Signal) -> Result<(), AppError> {
        let target: libc::pid_t = pid
            .try_into()
            .map_err(|_| AppError::InvalidArgument(format!("pid {} out of range", pid)))?;
        send_raw(target, signal).map_err(|e| match e.raw_os_error() {
            Some(libc::ESRCH) => AppError::NotFound(format!("process {}", pid)),
            Some(libc::EPERM) => AppError::PermissionDenied(format!(
                "not allowed to send {} to process {}",
                signal.name(),
                pid
            )),
            _ => AppError::Io(e),
        })
    }

    #[cfg(not(unix))]
    fn send(&self, pid: u32, signal: Signal) -> Result<(), AppError> {
        let mut sys = self.lock_system()?;
        let sys_pid = Pid::from_u32(pid);
        sys.refresh_process(sys_pid);
        let process = sys
            .process(sys_pid)
            .ok_or_else(|| AppError::NotFound(format!("process {}", pid)))?;
        let sent = match signal {
            Signal::Term => process.kill_with(sysinfo::Signal::Term).unwrap_or_else(|| process.kill()),
            Signal::Kill => process.kill(),
        };
        if sent {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(format!(
                "not allowed to send {} to process {}",
                signal.name(),
                pid
            )))
        }
    }
}
