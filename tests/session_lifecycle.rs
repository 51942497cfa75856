#![cfg(unix)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use term_commander::{AppError, Config, ToolHandler};

async fn handler() -> ToolHandler {
    let config = Config {
        default_shell: "/bin/sh".to_string(),
        files_root: std::env::temp_dir(),
        blocked_commands: vec!["sudo".to_string()],
        termination_grace_ms: 500,
        output_drain_timeout_ms: 300,
        ..Config::default()
    };
    ToolHandler::new(Arc::new(config)).await.unwrap()
}

/// A zombie waiting for its reaper counts as gone.
fn process_exists(pid: u64) -> bool {
    let mut sys = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(pid as u32);
    sys.refresh_process(pid)
        && sys
            .process(pid)
            .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
}

async fn execute(handler: &ToolHandler, arguments: Value) -> Value {
    handler.call_tool("execute_command", arguments).await.unwrap()
}

/// Polls read_output until the session leaves `running`; returns the
/// concatenated output and the final read.
async fn drain(handler: &ToolHandler, pid: &Value) -> (String, Value) {
    let mut output = String::new();
    for _ in 0..400 {
        let read = handler
            .call_tool("read_output", json!({ "pid": pid }))
            .await
            .unwrap();
        output.push_str(read["chunk"].as_str().unwrap());
        if read["status"] != "running" {
            return (output, read);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session {pid} did not finish");
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_completes_and_reads_concatenate() {
    let handler = handler().await;
    let started = execute(&handler, json!({ "command": "echo hello", "timeout_ms": 5000 })).await;
    assert_eq!(started["status"], "running");
    let pid = started["pid"].clone();

    let (output, last) = drain(&handler, &pid).await;
    assert_eq!(output, "hello\n");
    assert_eq!(last["status"], "completed");
    assert_eq!(last["exitCode"], 0);
    assert_eq!(last["drained"], true);

    // Later reads are empty but keep reporting the terminal status.
    let again = handler.call_tool("read_output", json!({ "pid": pid })).await.unwrap();
    assert_eq!(again["chunk"], "");
    assert_eq!(again["status"], "completed");
    handler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_output_is_gapless() {
    let handler = handler().await;
    let started = execute(
        &handler,
        json!({ "command": "for i in 1 2 3 4 5; do echo line$i; sleep 0.05; done" }),
    )
    .await;
    let (output, last) = drain(&handler, &started["pid"]).await;
    assert_eq!(output, "line1\nline2\nline3\nline4\nline5\n");
    assert_eq!(last["status"], "completed");
    handler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sleep_times_out() {
    let handler = handler().await;
    let begun = Instant::now();
    let started = execute(&handler, json!({ "command": "sleep 10", "timeout_ms": 100 })).await;
    let (_, last) = drain(&handler, &started["pid"]).await;
    assert_eq!(last["status"], "timedOut");
    assert!(begun.elapsed() >= Duration::from_millis(100));
    assert!(begun.elapsed() < Duration::from_secs(3));
    assert!(!process_exists(started["osPid"].as_u64().unwrap()));

    let listed = handler.call_tool("list_sessions", Value::Null).await.unwrap();
    let running = listed["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|s| s["status"] == "running")
        .count();
    assert_eq!(running, 0);
    handler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn force_terminate_stops_output_growth() {
    let handler = handler().await;
    let started = execute(&handler, json!({ "command": "while true; do echo tick; sleep 0.02; done" })).await;
    let pid = started["pid"].clone();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let begun = Instant::now();
    let stopped = handler
        .call_tool("force_terminate", json!({ "session_id": pid }))
        .await
        .unwrap();
    assert_eq!(stopped["status"], "terminated");
    assert_eq!(stopped["success"], true);
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert!(!process_exists(stopped["osPid"].as_u64().unwrap()));

    let size = stopped["outputBytes"].as_u64().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let listed = handler.call_tool("list_sessions", Value::Null).await.unwrap();
    let session = listed["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["pid"] == pid)
        .cloned()
        .unwrap();
    assert_eq!(session["outputBytes"].as_u64().unwrap(), size);

    let err = handler
        .call_tool("force_terminate", json!({ "pid": pid }))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    handler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_affects_only_future_spawns() {
    let handler = handler().await;
    let running = execute(&handler, json!({ "command": "sleep 0.3; echo survived" })).await;

    handler
        .call_tool("block_command", json!({ "command": "sleep" }))
        .await
        .unwrap();
    let err = handler
        .call_tool("execute_command", json!({ "command": "sleep 1" }))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CommandBlocked(ref name) if name == "sleep"));

    let (output, last) = drain(&handler, &running["pid"]).await;
    assert_eq!(output, "survived\n");
    assert_eq!(last["status"], "completed");

    handler
        .call_tool("unblock_command", json!({ "command": "sleep" }))
        .await
        .unwrap();
    execute(&handler, json!({ "command": "sleep 0" })).await;
    handler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_rm_creates_no_session() {
    let handler = handler().await;
    handler
        .call_tool("block_command", json!({ "command": "rm" }))
        .await
        .unwrap();
    let err = handler
        .call_tool("execute_command", json!({ "command": "rm -rf /tmp/x" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "CommandBlocked");
    let listed = handler.call_tool("list_sessions", Value::Null).await.unwrap();
    assert!(listed["sessions"].as_array().unwrap().is_empty());
    handler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handles_are_unique_across_sessions() {
    let handler = handler().await;
    let mut pids = Vec::new();
    for _ in 0..5 {
        let started = execute(&handler, json!({ "command": "true" })).await;
        pids.push(started["pid"].as_u64().unwrap());
    }
    let mut deduped = pids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), pids.len());
    handler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_session_is_not_found() {
    let handler = handler().await;
    let err = handler
        .call_tool("read_output", json!({ "pid": 999u64 << 32 }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");
    handler.shutdown().await;
}
