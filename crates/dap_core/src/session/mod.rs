//! Debug sessions and the orchestrator that owns them.

mod breakpoints;
mod console;
mod events;
mod orchestrator;
mod watch;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DebugConfig;
use crate::error::DapError;
use crate::registry::AdapterKind;
use crate::types::{Capabilities, Thread};

pub use breakpoints::{BreakpointChange, BreakpointId, BreakpointInfo, BreakpointOptions, BreakpointStore};
pub use console::{ConsoleBuffer, ConsoleKind, ConsoleMessage, ConsoleSource};
pub use events::OrchestratorEvent;
pub use orchestrator::{OrchestratorBuilder, SessionOrchestrator};
pub use watch::{WatchExpression, WatchId, WatchList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = DapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| DapError::user_input(format!("Invalid session id '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Running,
    Stopped,
    Terminated,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    /// `Stopped` may be re-entered; `Terminated` is final.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Initializing, Running) => true,
            (Running, Stopped) | (Stopped, Stopped) => true,
            (Stopped, Running) | (Running, Running) => true,
            _ => false,
        }
    }

    pub fn is_terminated(self) -> bool {
        self == SessionState::Terminated
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a session, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub kind: AdapterKind,
    pub state: SessionState,
    pub capabilities: Capabilities,
    pub current_thread_id: Option<i64>,
    pub current_frame_id: Option<i64>,
    pub threads: Vec<Thread>,
    pub config: DebugConfig,
    pub workspace_root: Option<PathBuf>,
    /// Which discovery strategy (or override) produced the adapter.
    pub adapter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use SessionState::*;
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Terminated));
        assert!(Stopped.can_transition_to(Terminated));

        assert!(!Initializing.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Initializing));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn test_session_id_round_trips_through_text() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().expect("parses");
        assert_eq!(parsed, id);

        let err = "not-a-session".parse::<SessionId>().unwrap_err();
        assert!(matches!(err, DapError::UserInput(_)));
    }
}
