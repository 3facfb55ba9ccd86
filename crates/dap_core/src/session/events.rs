use serde::Serialize;

use super::{
    BreakpointChange, BreakpointInfo, ConsoleMessage, SessionId, SessionState, WatchExpression,
    WatchId,
};
use crate::registry::AdapterKind;
use crate::types::Thread;

/// Notifications for the UI sink. Serialized as `{"event": .., "body": ..}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "body", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OrchestratorEvent {
    SessionCreated {
        session: SessionId,
        name: String,
        kind: AdapterKind,
    },
    SessionTerminated {
        session: SessionId,
        reason: String,
    },
    SessionStateChanged {
        session: SessionId,
        state: SessionState,
    },
    Stopped {
        session: SessionId,
        reason: String,
        description: Option<String>,
        thread_id: Option<i64>,
        frame_id: Option<i64>,
    },
    Continued {
        session: SessionId,
        thread_id: Option<i64>,
    },
    Output {
        session: SessionId,
        category: Option<String>,
        output: String,
    },
    BreakpointChanged {
        change: BreakpointChange,
        breakpoint: BreakpointInfo,
    },
    BreakpointValidated {
        breakpoint: BreakpointInfo,
    },
    ThreadsUpdated {
        session: SessionId,
        threads: Vec<Thread>,
    },
    ConsoleMessage {
        message: ConsoleMessage,
    },
    WatchAdded {
        watch: WatchExpression,
    },
    WatchRemoved {
        id: WatchId,
    },
    WatchUpdated {
        watch: WatchExpression,
    },
}

impl OrchestratorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "sessionCreated",
            Self::SessionTerminated { .. } => "sessionTerminated",
            Self::SessionStateChanged { .. } => "sessionStateChanged",
            Self::Stopped { .. } => "stopped",
            Self::Continued { .. } => "continued",
            Self::Output { .. } => "output",
            Self::BreakpointChanged { .. } => "breakpointChanged",
            Self::BreakpointValidated { .. } => "breakpointValidated",
            Self::ThreadsUpdated { .. } => "threadsUpdated",
            Self::ConsoleMessage { .. } => "consoleMessage",
            Self::WatchAdded { .. } => "watchAdded",
            Self::WatchRemoved { .. } => "watchRemoved",
            Self::WatchUpdated { .. } => "watchUpdated",
        }
    }

    /// Session the event belongs to, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::SessionCreated { session, .. }
            | Self::SessionTerminated { session, .. }
            | Self::SessionStateChanged { session, .. }
            | Self::Stopped { session, .. }
            | Self::Continued { session, .. }
            | Self::Output { session, .. }
            | Self::ThreadsUpdated { session, .. } => Some(*session),
            _ => None,
        }
    }
}
