//! Debug Session Core
//!
//! Async orchestration of Debug Adapter Protocol sessions: adapter
//! discovery, transports, request/response correlation and the session
//! state machine with breakpoints, watches and console history.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use client::ProtocolClient;
pub use config::{DapConfig, DebugConfig, RequestMode};
pub use error::DapError;
pub use registry::{AdapterKind, AdapterRegistry};
pub use resolver::{AdapterInfo, AdapterResolver, ResolvedAdapter};
pub use session::{
    BreakpointInfo, BreakpointOptions, OrchestratorEvent, Session, SessionId,
    SessionOrchestrator, SessionState, WatchExpression,
};
pub use transport::RemoteConnector;

/// Result type alias using DapError
pub type Result<T> = std::result::Result<T, DapError>;
