pub mod blocklist_tool;
pub mod config_tool;
pub mod process_tool;
pub mod terminal_tool;
