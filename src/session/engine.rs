use super::blocklist::BlocklistStore;
use super::handle::SessionId;
use super::registry::{SessionInfo, SessionRegistry};
use super::termination::{stop_child, sweep_group};
use super::{SessionStatus, StopIntent};
use crate::config::{Config, ExitPolicy};
use crate::error::AppError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub command: String,
    pub timeout: Option<Duration>,
    /// Overrides the configured default shell.
    pub shell: Option<String>,
}

/// Process settings shared by every session the engine starts.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_shell: String,
    pub working_dir: PathBuf,
    pub termination_grace: Duration,
    pub output_drain_timeout: Duration,
    pub exit_policy: ExitPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_shell: config.default_shell.clone(),
            working_dir: config.files_root.clone(),
            termination_grace: config.termination_grace(),
            output_drain_timeout: config.output_drain_timeout(),
            exit_policy: config.exit_policy,
        }
    }
}

/// Starts sessions and supervises each one until it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    registry: Arc<SessionRegistry>,
    blocklist: Arc<BlocklistStore>,
    settings: Arc<EngineSettings>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<SessionRegistry>, blocklist: Arc<BlocklistStore>, settings: EngineSettings) -> Self {
        Self {
            registry,
            blocklist,
            settings: Arc::new(settings),
        }
    }

    /// Validates and launches a command, returning as soon as the session is
    /// registered. A command that cannot be spawned still yields a session, in
    /// the `failed` state, carrying the spawn error.
    #[instrument(skip(self, request), fields(command = %request.command))]
    pub async fn execute(&self, request: ExecuteRequest) -> Result<SessionInfo, AppError> {
        if request.command.trim().is_empty() {
            return Err(AppError::InvalidArgument("command must not be empty".to_string()));
        }
        if let Some(timeout) = request.timeout {
            validate_timeout(timeout)?;
        }
        if let Some(token) = self.blocklist.blocked_token(&request.command) {
            warn!(command = %request.command, token = %token, "Refusing blocked command");
            return Err(AppError::CommandBlocked(token.to_string()));
        }

        let shell = request
            .shell
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.settings.default_shell)
            .to_string();

        let mut cmd = build_command(&shell, &request.command, &self.settings.working_dir);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return self.record_spawn_failure(&request, &shell, e).await,
        };

        let os_pid = child.id();
        let id = match self
            .registry
            .create(&request.command, &shell, request.timeout, os_pid)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };
        info!(sid = %id, os_pid = ?os_pid, shell = %shell, "Session started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(self.registry.clone(), id, stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(self.registry.clone(), id, stderr, "stderr")));
        }

        let deadline = request.timeout.and_then(|t| Instant::now().checked_add(t));
        tokio::spawn(supervise(
            self.registry.clone(),
            id,
            child,
            readers,
            deadline,
            self.settings.clone(),
        ));

        self.registry.get(id).await
    }

    async fn record_spawn_failure(
        &self,
        request: &ExecuteRequest,
        shell: &str,
        cause: std::io::Error,
    ) -> Result<SessionInfo, AppError> {
        let failure = AppError::SpawnFailure(format!("{}: {}", shell, cause));
        error!(command = %request.command, error = %failure, "Spawn failed");
        let id = self
            .registry
            .create(&request.command, shell, request.timeout, None)
            .await?;
        self.registry.record_error(id, &failure.to_string()).await?;
        self.registry.transition(id, SessionStatus::Failed, None).await
    }
}

/// A timeout must be positive and its deadline representable both as a
/// monotonic instant and as a wall-clock timestamp.
fn validate_timeout(timeout: Duration) -> Result<(), AppError> {
    if timeout.is_zero() {
        return Err(AppError::InvalidArgument("timeout_ms must be greater than zero".to_string()));
    }
    let wall = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|t| chrono::Utc::now().checked_add_signed(t));
    if wall.is_none() || Instant::now().checked_add(timeout).is_none() {
        return Err(AppError::InvalidArgument(format!(
            "timeout_ms {} is out of range",
            timeout.as_millis()
        )));
    }
    Ok(())
}

/// The argument list that makes `shell` run `command` as a single script.
pub(crate) fn shell_args(shell: &str, command: &str) -> Vec<String> {
    let name = Path::new(shell)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(shell)
        .to_lowercase();
    match name.as_str() {
        "cmd" => vec!["/C".to_string(), command.to_string()],
        "powershell" | "pwsh" => vec![
            "-NoProfile".to_string(),
            "-Command".to_string(),
            command.to_string(),
        ],
        _ => vec!["-c".to_string(), command.to_string()],
    }
}

fn build_command(shell: &str, command: &str, working_dir: &Path) -> TokioCommand {
    let mut cmd = TokioCommand::new(shell);
    cmd.args(shell_args(shell, command))
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so a stop reaches everything the shell started.
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

async fn pump_output<R>(registry: Arc<SessionRegistry>, id: SessionId, mut stream: R, label: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = registry.append_output(id, &buf[..n]).await {
                    debug!(sid = %id, stream = label, error = %e, "Session gone, stopping capture");
                    break;
                }
            }
            Err(e) => {
                warn!(sid = %id, stream = label, error = %e, "Error reading process output");
                break;
            }
        }
    }
    debug!(sid = %id, stream = label, "Capture finished");
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn supervise(
    registry: Arc<SessionRegistry>,
    id: SessionId,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    deadline: Option<Instant>,
    settings: Arc<EngineSettings>,
) {
    let stop = match registry.stop_notifier(id).await {
        Ok(stop) => stop,
        Err(e) => {
            error!(sid = %id, error = %e, "Session vanished before supervision started");
            let _ = child.start_kill();
            return;
        }
    };

    // The group id outlives the leader, so keep it for the sweep after wait().
    let leader = child.id();
    let (exited, stopped) = tokio::select! {
        status = child.wait() => {
            sweep_group(leader);
            (status, false)
        }
        _ = stop.notified() => {
            debug!(sid = %id, "Stop requested, signalling process group");
            (stop_child(&mut child, settings.termination_grace).await, true)
        }
        _ = deadline_elapsed(deadline) => {
            match registry.request_stop(id, StopIntent::Timeout).await {
                Ok(intent) => info!(sid = %id, intent = ?intent, "Session deadline reached"),
                Err(e) => debug!(sid = %id, error = %e, "Deadline reached after session finished"),
            }
            (stop_child(&mut child, settings.termination_grace).await, true)
        }
    };
    let exit_status = match exited {
        Ok(status) => Some(status),
        Err(e) => {
            error!(sid = %id, error = %e, "Failed to wait for process");
            None
        }
    };

    drain_readers(id, readers, settings.output_drain_timeout).await;
    record_outcome(&registry, id, stopped, exit_status, settings.exit_policy).await;
}

/// Records the terminal state. The stop intent only decides it when the
/// process was actually stopped; a stop that lands after a natural exit does
/// not rewrite how the session ended.
async fn record_outcome(
    registry: &SessionRegistry,
    id: SessionId,
    stopped: bool,
    exit_status: Option<ExitStatus>,
    policy: ExitPolicy,
) {
    let intent = if stopped {
        registry.stop_intent(id).await.ok().flatten()
    } else {
        None
    };
    let status = match intent {
        Some(intent) => intent.into(),
        None => classify_exit(exit_status.as_ref(), policy),
    };
    let exit_code = exit_status.and_then(|s| s.code());
    if let Err(e) = registry.transition(id, status, exit_code).await {
        warn!(sid = %id, error = %e, "Could not record final session state");
    }
}

/// Status of a process that exited without a stop request.
fn classify_exit(status: Option<&ExitStatus>, policy: ExitPolicy) -> SessionStatus {
    match (status, policy) {
        (Some(s), _) if s.success() => SessionStatus::Completed,
        (Some(_), ExitPolicy::Informational) => SessionStatus::Completed,
        _ => SessionStatus::Failed,
    }
}

/// Waits for capture tasks to hit end-of-stream. A pipe held open by a
/// descendant outside the session's group would never close, so capture is
/// abandoned at `limit`.
async fn drain_readers(id: SessionId, readers: Vec<JoinHandle<()>>, limit: Duration) {
    let deadline = Instant::now() + limit;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            warn!(sid = %id, limit_ms = limit.as_millis() as u64, "Output stream still open after exit, abandoning capture");
            reader.abort();
            let _ = reader.await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn engine_with(blocked: &[&str], policy: ExitPolicy) -> (Arc<SessionRegistry>, ExecutionEngine) {
        let registry = Arc::new(SessionRegistry::new());
        let names: Vec<String> = blocked.iter().map(|s| s.to_string()).collect();
        let blocklist = Arc::new(BlocklistStore::in_memory(&names));
        let settings = EngineSettings {
            default_shell: "/bin/sh".to_string(),
            working_dir: std::env::temp_dir(),
            termination_grace: Duration::from_millis(500),
            output_drain_timeout: Duration::from_millis(300),
            exit_policy: policy,
        };
        (registry.clone(), ExecutionEngine::new(registry, blocklist, settings))
    }

    fn request(command: &str, timeout_ms: Option<u64>) -> ExecuteRequest {
        ExecuteRequest {
            command: command.to_string(),
            timeout: timeout_ms.map(Duration::from_millis),
            shell: None,
        }
    }

    async fn finish(registry: &SessionRegistry, id: SessionId) -> SessionInfo {
        registry.wait_terminal(id, Duration::from_secs(10)).await.unwrap()
    }

    /// Zombies count as dead: an orphan may wait a while for its reaper.
    fn is_alive(pid: u32) -> bool {
        let mut sys = sysinfo::System::new();
        let pid = sysinfo::Pid::from_u32(pid);
        sys.refresh_process(pid)
            && sys
                .process(pid)
                .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
    }

    /// SIGKILL delivery is asynchronous, so allow the kernel a moment.
    async fn gone_soon(pid: u32) -> bool {
        for _ in 0..40 {
            if !is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    async fn output_of(registry: &SessionRegistry, id: SessionId) -> String {
        registry
            .with_record(id, |record| String::from_utf8_lossy(&record.output).into_owned())
            .await
            .unwrap()
    }

    #[test]
    fn test_shell_args() {
        assert_eq!(shell_args("/bin/bash", "ls"), vec!["-c", "ls"]);
        assert_eq!(shell_args("cmd.exe", "dir"), vec!["/C", "dir"]);
        assert_eq!(shell_args("pwsh", "Get-Date"), vec!["-NoProfile", "-Command", "Get-Date"]);
    }

    #[test]
    fn test_classify_exit() {
        use std::os::unix::process::ExitStatusExt;
        let ok = ExitStatus::from_raw(0);
        let bad = ExitStatus::from_raw(3 << 8);
        assert_eq!(classify_exit(Some(&ok), ExitPolicy::Failed), SessionStatus::Completed);
        assert_eq!(classify_exit(Some(&bad), ExitPolicy::Failed), SessionStatus::Failed);
        assert_eq!(classify_exit(Some(&bad), ExitPolicy::Informational), SessionStatus::Completed);
        assert_eq!(classify_exit(None, ExitPolicy::Informational), SessionStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_captures_both_streams() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        let info = engine
            .execute(request("echo out; echo err 1>&2", None))
            .await
            .unwrap();
        assert!(info.os_pid.is_some());

        let done = finish(&registry, info.pid).await;
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.output_bytes, "out\nerr\n".len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nonzero_exit_is_failed_by_default() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        let info = engine.execute(request("exit 3", None)).await.unwrap();
        let done = finish(&registry, info.pid).await;
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_informational_policy_completes_nonzero_exit() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Informational);
        let info = engine.execute(request("exit 3", None)).await.unwrap();
        let done = finish(&registry, info.pid).await;
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.exit_code, Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_stops_process() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        let started = std::time::Instant::now();
        let info = engine.execute(request("sleep 10", Some(200))).await.unwrap();
        let done = finish(&registry, info.pid).await;
        assert_eq!(done.status, SessionStatus::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(gone_soon(done.os_pid.unwrap()).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_out_of_range_timeout_is_rejected_before_spawn() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.execute(request("true", Some(10_000_000_000_000_000))).await }
        });
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(ref msg) if msg.contains("out of range")));
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_long_but_valid_timeout_is_accepted() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        let year_ms = 365 * 24 * 60 * 60 * 1000;
        let info = engine.execute(request("true", Some(year_ms))).await.unwrap();
        assert!(info.timeout_deadline_iso.is_some());
        assert_eq!(finish(&registry, info.pid).await.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_late_stop_does_not_rewrite_natural_exit() {
        use std::os::unix::process::ExitStatusExt;
        let registry = SessionRegistry::new();
        let exited = registry.create("true", "/bin/sh", None, Some(4242)).await.unwrap();
        registry.request_stop(exited, StopIntent::Terminate).await.unwrap();
        record_outcome(&registry, exited, false, Some(ExitStatus::from_raw(0)), ExitPolicy::Failed).await;
        let info = registry.get(exited).await.unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(info.exit_code, Some(0));

        let stopped = registry.create("sleep 5", "/bin/sh", None, Some(4243)).await.unwrap();
        registry.request_stop(stopped, StopIntent::Terminate).await.unwrap();
        record_outcome(&registry, stopped, true, Some(ExitStatus::from_raw(15)), ExitPolicy::Failed).await;
        assert_eq!(registry.get(stopped).await.unwrap().status, SessionStatus::Terminated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocked_command_creates_no_session() {
        let (registry, engine) = engine_with(&["rm"], ExitPolicy::Failed);
        let err = engine.execute(request("rm -rf /tmp/nothing", None)).await.unwrap_err();
        assert!(matches!(err, AppError::CommandBlocked(ref token) if token == "rm"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        assert!(matches!(
            engine.execute(request("  ", None)).await.unwrap_err(),
            AppError::InvalidArgument(_)
        ));
        assert!(matches!(
            engine.execute(request("true", Some(0))).await.unwrap_err(),
            AppError::InvalidArgument(_)
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_failed_session() {
        let (_registry, engine) = engine_with(&[], ExitPolicy::Failed);
        let mut req = request("echo hi", None);
        req.shell = Some("/definitely/not/a/shell".to_string());
        let info = engine.execute(req).await.unwrap();
        assert_eq!(info.status, SessionStatus::Failed);
        assert!(info.os_pid.is_none());
        assert!(info.error.unwrap().contains("/definitely/not/a/shell"));
        assert!(info.output_bytes > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_orphaned_pipe_does_not_hang_supervisor() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        // The background sleep inherits stdout and would outlive the shell.
        let info = engine.execute(request("sleep 5 & echo $!", None)).await.unwrap();
        let done = registry.wait_terminal(info.pid, Duration::from_secs(3)).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);

        let background: u32 = output_of(&registry, info.pid).await.trim().parse().unwrap();
        assert!(gone_soon(background).await, "background pid {} outlived its session", background);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_descendants_are_reaped_after_natural_exit() {
        let (registry, engine) = engine_with(&[], ExitPolicy::Failed);
        let info = engine
            .execute(request("sleep 30 >/dev/null 2>&1 & echo $!", None))
            .await
            .unwrap();
        let done = finish(&registry, info.pid).await;
        assert_eq!(done.status, SessionStatus::Completed);

        let background: u32 = output_of(&registry, info.pid).await.trim().parse().unwrap();
        assert!(gone_soon(background).await, "background pid {} outlived its session", background);
    }
}
