//! Scripted in-memory debug adapter reached through the remote-connection
//! seam, so sessions run without spawning anything.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dap_core::config::{DapConfig, DebugConfig};
use dap_core::protocol::{read_message, write_message, Event, ProtocolMessage, Request, Response};
use dap_core::registry::AdapterKind;
use dap_core::resolver::ResolvedAdapter;
use dap_core::transport::{RemoteConnector, TunnelStream};
use dap_core::{OrchestratorEvent, SessionOrchestrator};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

pub const TOP_FRAME_ID: i64 = 1000;
pub const LOCALS_REFERENCE: i64 = 7;

/// How the fake adapter answers.
#[derive(Debug, Clone)]
pub struct Script {
    pub capabilities: Value,
    pub send_initialized: bool,
    /// Added to every requested breakpoint line on verification.
    pub line_offset: u32,
    pub evaluate_error: Option<String>,
    /// Limits `evaluate_error` to this one expression.
    pub failing_expression: Option<String>,
    pub launch_error: Option<String>,
    /// Commands that are logged but never answered.
    pub unanswered: Vec<&'static str>,
    /// Reports a new stop before acknowledging `continue`.
    pub stop_on_continue: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: json!({
                "supportsConfigurationDoneRequest": true,
                "supportsTerminateRequest": true,
            }),
            send_initialized: true,
            line_offset: 0,
            evaluate_error: None,
            failing_expression: None,
            launch_error: None,
            unanswered: Vec::new(),
            stop_on_continue: false,
        }
    }
}

enum Outbound {
    Message(ProtocolMessage),
    Close,
}

/// Test-side handle on one fake adapter connection.
#[derive(Clone)]
pub struct AdapterControl {
    requests: Arc<Mutex<Vec<Request>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl AdapterControl {
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn requests(&self, command: &str) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.command == command)
            .cloned()
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.requests(command).len()
    }

    pub fn send_event(&self, event: &str, body: Value) {
        let _ = self.outbound.send(Outbound::Message(ProtocolMessage::Event(Event {
            seq: 0,
            event: event.to_string(),
            body: Some(body),
        })));
    }

    /// Drops the connection from the adapter side.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

pub struct ScriptedConnector {
    script: Script,
    controls: Mutex<Vec<AdapterControl>>,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            controls: Mutex::new(Vec::new()),
        })
    }

    /// Control for the most recently opened connection.
    pub fn last(&self) -> AdapterControl {
        self.controls
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no adapter connection opened yet")
    }

    pub fn connections(&self) -> usize {
        self.controls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteConnector for ScriptedConnector {
    async fn open_tunnel(
        &self,
        _adapter: &ResolvedAdapter,
        _config: &DebugConfig,
    ) -> dap_core::Result<Box<dyn TunnelStream>> {
        let (client_side, adapter_side) = tokio::io::duplex(64 * 1024);
        let control = spawn_fake_adapter(adapter_side, self.script.clone());
        self.controls.lock().unwrap().push(control);
        Ok(Box::new(client_side))
    }
}

fn spawn_fake_adapter(stream: tokio::io::DuplexStream, script: Script) -> AdapterControl {
    let (read, mut write) = tokio::io::split(stream);
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let requests = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn(async move {
        let mut seq = 1;
        while let Some(next) = outbound_rx.recv().await {
            match next {
                Outbound::Message(mut message) => {
                    match &mut message {
                        ProtocolMessage::Response(r) => r.seq = seq,
                        ProtocolMessage::Event(e) => e.seq = seq,
                        ProtocolMessage::Request(r) => r.seq = seq,
                    }
                    seq += 1;
                    if write_message(&mut write, &message).await.is_err() {
                        return;
                    }
                }
                Outbound::Close => {
                    let _ = write.shutdown().await;
                    return;
                }
            }
        }
    });

    let log = requests.clone();
    let replies = outbound.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        let mut next_breakpoint_id = 1;
        while let Ok(message) = read_message(&mut reader).await {
            let ProtocolMessage::Request(request) = message else {
                continue;
            };
            log.lock().unwrap().push(request.clone());
            if script.unanswered.contains(&request.command.as_str()) {
                continue;
            }
            if script.stop_on_continue && request.command == "continue" {
                let stopped = Event {
                    seq: 0,
                    event: "stopped".into(),
                    body: Some(json!({ "reason": "breakpoint", "threadId": 1 })),
                };
                let _ = replies.send(Outbound::Message(ProtocolMessage::Event(stopped)));
            }

            let (response, follow_up) = answer(&script, &request, &mut next_breakpoint_id);
            let _ = replies.send(Outbound::Message(ProtocolMessage::Response(response)));
            if let Some(event) = follow_up {
                let _ = replies.send(Outbound::Message(ProtocolMessage::Event(event)));
            }
        }
    });

    AdapterControl { requests, outbound }
}

fn answer(script: &Script, request: &Request, next_breakpoint_id: &mut i64) -> (Response, Option<Event>) {
    let args = request.arguments.clone().unwrap_or(Value::Null);
    let ok = |body: Option<Value>| Response {
        seq: 0,
        request_seq: request.seq,
        command: request.command.clone(),
        success: true,
        message: None,
        body,
    };
    let fail = |message: &str| Response {
        seq: 0,
        request_seq: request.seq,
        command: request.command.clone(),
        success: false,
        message: Some("request failed".into()),
        body: Some(json!({ "error": { "id": 1, "format": message } })),
    };

    match request.command.as_str() {
        "initialize" => {
            let initialized = script.send_initialized.then(|| Event {
                seq: 0,
                event: "initialized".into(),
                body: None,
            });
            (ok(Some(script.capabilities.clone())), initialized)
        }
        "launch" | "attach" => match &script.launch_error {
            Some(message) => (fail(message), None),
            None => (ok(None), None),
        },
        "setBreakpoints" => {
            let requested = args["breakpoints"].as_array().cloned().unwrap_or_default();
            let verified: Vec<Value> = requested
                .iter()
                .map(|bp| {
                    let line = bp["line"].as_u64().unwrap_or(0) as u32 + script.line_offset;
                    let id = *next_breakpoint_id;
                    *next_breakpoint_id += 1;
                    json!({ "id": id, "verified": true, "line": line })
                })
                .collect();
            (ok(Some(json!({ "breakpoints": verified }))), None)
        }
        "threads" => (
            ok(Some(json!({ "threads": [{ "id": 1, "name": "MainThread" }] }))),
            None,
        ),
        "stackTrace" => (
            ok(Some(json!({
                "stackFrames": [
                    { "id": TOP_FRAME_ID, "name": "handler", "line": 11, "column": 1 },
                    { "id": TOP_FRAME_ID + 1, "name": "main", "line": 40, "column": 1 },
                ],
                "totalFrames": 2,
            }))),
            None,
        ),
        "scopes" => (
            ok(Some(json!({
                "scopes": [{ "name": "Locals", "variablesReference": LOCALS_REFERENCE, "expensive": false }]
            }))),
            None,
        ),
        "variables" => (
            ok(Some(json!({
                "variables": [{ "name": "count", "value": "42", "type": "int", "variablesReference": 0 }]
            }))),
            None,
        ),
        "evaluate" => {
            let expression = args["expression"].as_str().unwrap_or_default();
            let fails = script
                .failing_expression
                .as_deref()
                .map_or(true, |failing| failing == expression);
            match &script.evaluate_error {
                Some(message) if fails => (fail(message), None),
                _ => (
                    ok(Some(json!({ "result": format!("<{expression}>"), "variablesReference": 0 }))),
                    None,
                ),
            }
        }
        "configurationDone" | "continue" | "next" | "stepIn" | "stepOut" | "pause"
        | "restart" | "terminate" | "disconnect" => (ok(None), None),
        _ => (fail("unsupported request"), None),
    }
}

pub fn settings() -> DapConfig {
    DapConfig::default()
        .with_request_timeout(Duration::from_secs(2))
        .with_initialized_event_timeout(Duration::from_millis(300))
}

pub fn orchestrator(connector: &Arc<ScriptedConnector>) -> SessionOrchestrator {
    SessionOrchestrator::builder(settings())
        .remote_connector(connector.clone())
        .build()
}

/// Launch configuration routed to the scripted adapter.
pub fn remote_config(program: &str) -> DebugConfig {
    let mut config = DebugConfig::launch(AdapterKind::Debugpy, program);
    config.adapter_path = Some(PathBuf::from("/opt/fake/debug-adapter"));
    config.remote = true;
    config
}

pub async fn expect_event<F>(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    mut matches: F,
) -> OrchestratorEvent
where
    F: FnMut(&OrchestratorEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for orchestrator event")
}
