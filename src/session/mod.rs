//! Terminal session manager: the blocklist, the session registry, and the
//! engine, reader and controller that drive sessions through their lifecycle.

pub mod blocklist;
pub mod engine;
pub mod handle;
pub mod reader;
pub mod registry;
pub mod termination;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use blocklist::{BlocklistBackend, BlocklistStore, JsonFileBackend, MemoryBackend};
pub use engine::{EngineSettings, ExecuteRequest, ExecutionEngine};
pub use handle::SessionId;
pub use reader::{OutputChunk, OutputReader};
pub use registry::{EvictionPolicy, SessionInfo, SessionRegistry};
pub use termination::{KillOutcome, Signal, TerminationController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Running,
    Completed,
    TimedOut,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    /// Only `running` has outgoing edges, and only into terminal states.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(self, SessionStatus::Running) && next.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::TimedOut => "timedOut",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a running session is being stopped. The first recorded intent wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopIntent {
    Terminate,
    Timeout,
}

impl From<StopIntent> for SessionStatus {
    fn from(intent: StopIntent) -> Self {
        match intent {
            StopIntent::Terminate => SessionStatus::Terminated,
            StopIntent::Timeout => SessionStatus::TimedOut,
        }
    }
}
