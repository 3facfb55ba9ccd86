use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleKind {
    Input,
    Output,
    Error,
    Warning,
    Info,
}

impl ConsoleKind {
    /// Maps an `output` event category. Telemetry is not shown.
    pub fn from_category(category: Option<&str>) -> Option<Self> {
        match category {
            Some("telemetry") => None,
            Some("stderr") => Some(Self::Error),
            Some("console") | Some("important") => Some(Self::Info),
            _ => Some(Self::Output),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSource {
    pub path: String,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    pub kind: ConsoleKind,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ConsoleSource>,
}

impl ConsoleMessage {
    pub fn new(kind: ConsoleKind, text: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            kind,
            text: text.into(),
            timestamp,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Option<ConsoleSource>) -> Self {
        self.source = source;
        self
    }
}

/// Append-only history that drops the oldest entry once full.
#[derive(Debug)]
pub struct ConsoleBuffer {
    capacity: usize,
    messages: VecDeque<ConsoleMessage>,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(256)),
        }
    }

    pub fn push(&mut self, message: ConsoleMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<ConsoleMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
