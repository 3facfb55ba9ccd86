use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::{AdapterDefinition, AdapterKind};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_INITIALIZED_EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONSOLE_CAPACITY: usize = 1024;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Runtime knobs for the orchestrator and everything below it.
#[derive(Debug, Clone)]
pub struct DapConfig {
    /// Deadline applied to every outbound request unless overridden.
    pub request_timeout: Duration,
    pub initialize_timeout: Duration,
    /// How long to wait for the adapter's `initialized` event before
    /// sending `configurationDone` anyway.
    pub initialized_event_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub connect_timeout: Duration,
    /// Deadline for discovery subprocesses (`npm prefix -g`, import probes).
    pub probe_timeout: Duration,
    pub console_capacity: usize,
    pub event_capacity: usize,
}

impl Default for DapConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initialize_timeout: DEFAULT_INITIALIZE_TIMEOUT,
            initialized_event_timeout: DEFAULT_INITIALIZED_EVENT_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            console_capacity: DEFAULT_CONSOLE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl DapConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_initialized_event_timeout(mut self, timeout: Duration) -> Self {
        self.initialized_event_timeout = timeout;
        self
    }

    pub fn with_console_capacity(mut self, capacity: usize) -> Self {
        self.console_capacity = capacity.max(1);
        self
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_millis("DAP_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            initialize_timeout: env_millis("DAP_INITIALIZE_TIMEOUT_MS")
                .unwrap_or(defaults.initialize_timeout),
            initialized_event_timeout: env_millis("DAP_INITIALIZED_WAIT_MS")
                .unwrap_or(defaults.initialized_event_timeout),
            disconnect_timeout: env_millis("DAP_DISCONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.disconnect_timeout),
            connect_timeout: env_millis("DAP_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            probe_timeout: env_millis("DAP_PROBE_TIMEOUT_MS").unwrap_or(defaults.probe_timeout),
            console_capacity: env_usize("DAP_CONSOLE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.console_capacity),
            event_capacity: env_usize("DAP_EVENT_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.event_capacity),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_usize(name).map(|ms| Duration::from_millis(ms as u64))
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<usize>().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    #[default]
    Launch,
    Attach,
}

impl RequestMode {
    pub fn command(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Attach => "attach",
        }
    }
}

/// A launch configuration as handed over by the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugConfig {
    #[serde(rename = "type")]
    pub kind: AdapterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub request: RequestMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on_entry: Option<bool>,
    /// Run this adapter binary instead of discovering one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_path: Option<PathBuf>,
    /// Port of an adapter server that is already listening on loopback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_server: Option<u16>,
    /// Carry the adapter traffic over the remote-connection tunnel.
    #[serde(default)]
    pub remote: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DebugConfig {
    pub fn launch(kind: AdapterKind, program: impl Into<String>) -> Self {
        Self {
            kind,
            name: None,
            request: RequestMode::Launch,
            program: Some(program.into()),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            host: None,
            port: None,
            process_id: None,
            stop_on_entry: None,
            adapter_path: None,
            debug_server: None,
            remote: false,
            extra: Map::new(),
        }
    }

    pub fn attach(kind: AdapterKind, process_id: u32) -> Self {
        Self {
            request: RequestMode::Attach,
            program: None,
            process_id: Some(process_id),
            ..Self::launch(kind, "")
        }
    }

    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.program, self.process_id) {
            (Some(program), _) if !program.is_empty() => {
                let file = std::path::Path::new(program)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| program.clone());
                format!("{}: {file}", self.kind)
            }
            (_, Some(pid)) => format!("{}: pid {pid}", self.kind),
            _ => self.kind.to_string(),
        }
    }

    /// Arguments for the `launch`/`attach` request: the kind's template,
    /// overlaid with this document's fields, overlaid with `extra`.
    pub fn request_arguments(&self, definition: &AdapterDefinition) -> Value {
        let mut args = match definition.launch_template() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        args.insert("request".into(), Value::from(self.request.command()));
        args.insert("name".into(), Value::from(self.display_name()));
        if let Some(program) = self.program.as_ref().filter(|p| !p.is_empty()) {
            args.insert("program".into(), Value::from(program.as_str()));
        }
        if !self.args.is_empty() {
            args.insert("args".into(), Value::from(self.args.clone()));
        }
        if let Some(cwd) = &self.cwd {
            args.insert("cwd".into(), Value::from(cwd.to_string_lossy().into_owned()));
        }
        if !self.env.is_empty() {
            let env: Map<String, Value> = self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect();
            args.insert("env".into(), Value::Object(env));
        }
        if let Some(host) = &self.host {
            args.insert("host".into(), Value::from(host.as_str()));
        }
        if let Some(port) = self.port {
            args.insert("port".into(), Value::from(port));
        }
        if let Some(pid) = self.process_id {
            args.insert("processId".into(), Value::from(pid));
            args.insert("pid".into(), Value::from(pid));
        }
        if let Some(stop) = self.stop_on_entry {
            args.insert("stopOnEntry".into(), Value::from(stop));
        }
        for (key, value) in &self.extra {
            args.insert(key.clone(), value.clone());
        }
        Value::Object(args)
    }
}
