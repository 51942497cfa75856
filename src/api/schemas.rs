use serde::Serialize;
use serde_json::{json, Map, Value};

/// A tool as advertised to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

impl ToolDefinition {
    fn new(name: &'static str, description: &'static str, input_schema: Value) -> Self {
        Self {
            name,
            description,
            input_schema,
        }
    }
}

// Helper to create a JSON schema property
fn create_prop(type_str: &str, description: &str) -> Value {
    json!({
        "type": type_str,
        "description": description
    })
}

fn create_min_prop(type_str: &str, description: &str, minimum: u64) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "minimum": minimum
    })
}

fn object_schema(required: &[&str], properties: Vec<(&str, Value)>) -> Value {
    let properties: Map<String, Value> = properties
        .into_iter()
        .map(|(name, prop)| (name.to_string(), prop))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn empty_schema() -> Value {
    object_schema(&[], Vec::new())
}

const SESSION_PID_DESCRIPTION: &str = "Session handle returned by execute_command (the `pid` field). This is not an OS process id.";

pub fn execute_command_schema() -> Value {
    object_schema(
        &["command"],
        vec![
            ("command", create_prop("string", "Command line to run through the shell. Blocked commands are rejected.")),
            ("timeout_ms", create_min_prop("integer", "Optional deadline in milliseconds; the process is stopped and the session marked timedOut when it elapses.", 1)),
            ("shell", create_prop("string", "Shell to run the command with. Defaults to the server's configured shell.")),
        ],
    )
}

pub fn read_output_schema() -> Value {
    object_schema(
        &["pid"],
        vec![("pid", create_min_prop("integer", SESSION_PID_DESCRIPTION, 1))],
    )
}

pub fn force_terminate_schema() -> Value {
    object_schema(
        &["pid"],
        vec![("pid", create_min_prop("integer", SESSION_PID_DESCRIPTION, 1))],
    )
}

pub fn list_sessions_schema() -> Value {
    empty_schema()
}

pub fn kill_process_schema() -> Value {
    object_schema(
        &["pid"],
        vec![("pid", create_min_prop("integer", "Operating system process id to terminate.", 1))],
    )
}

pub fn list_processes_schema() -> Value {
    empty_schema()
}

pub fn block_command_schema() -> Value {
    object_schema(
        &["command"],
        vec![("command", create_prop("string", "Command name to block. A full command line is reduced to its first word."))],
    )
}

pub fn unblock_command_schema() -> Value {
    object_schema(
        &["command"],
        vec![("command", create_prop("string", "Command name to unblock."))],
    )
}

pub fn list_blocked_commands_schema() -> Value {
    empty_schema()
}

pub fn get_config_schema() -> Value {
    empty_schema()
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        // Terminal
        ToolDefinition::new("execute_command", "Start a shell command as a background session and return its handle immediately.", execute_command_schema()),
        ToolDefinition::new("read_output", "Read output produced by a session since the previous read, with its current status.", read_output_schema()),
        ToolDefinition::new("force_terminate", "Stop a running session, gracefully first and forcefully after a grace period.", force_terminate_schema()),
        ToolDefinition::new("list_sessions", "List running sessions and recently finished ones.", list_sessions_schema()),
        // Process
        ToolDefinition::new("kill_process", "Terminate an operating system process by PID.", kill_process_schema()),
        ToolDefinition::new("list_processes", "List running processes on the system.", list_processes_schema()),
        // Blocklist
        ToolDefinition::new("block_command", "Add a command name to the blocklist.", block_command_schema()),
        ToolDefinition::new("unblock_command", "Remove a command name from the blocklist.", unblock_command_schema()),
        ToolDefinition::new("list_blocked_commands", "List blocked command names.", list_blocked_commands_schema()),
        // Config
        ToolDefinition::new("get_config", "Get current server configuration.", get_config_schema()),
    ]
}
