use std::time::Duration;
use thiserror::Error;

use crate::registry::AdapterKind;
use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum DapError {
    /// Every discovery strategy for the kind came up empty.
    #[error("No runnable debug adapter found for '{kind}'")]
    Resolution { kind: AdapterKind },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Request '{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// Well-formed error response; displays the adapter's message as-is.
    #[error("{message}")]
    Adapter { command: String, message: String },

    #[error("{0}")]
    UserInput(String),

    #[error("Adapter does not support {0}")]
    Unsupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("No active debug session")]
    NoActiveSession,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

impl DapError {
    pub fn adapter(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn user_input(message: impl Into<String>) -> Self {
        Self::UserInput(message.into())
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::TransportClosed | Self::Io(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
