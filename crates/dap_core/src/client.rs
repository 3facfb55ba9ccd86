//! Request/response correlation and event fan-out for one adapter
//! connection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::{DapConfig, RequestMode};
use crate::error::DapError;
use crate::protocol::{
    decode_message, read_frame, write_message, Event, ProtocolMessage, Request, Response,
};
use crate::transport::{ReadHalf, Transport, WriteHalf};
use crate::types::{
    Breakpoint, Capabilities, EvaluateResponse, InitializeArguments, Scope, ScopesResponse,
    SetBreakpointsArguments, SetBreakpointsResponse, SetVariableResponse, Source,
    SourceBreakpoint, StackFrame, StackTraceResponse, Thread, ThreadsResponse, Variable,
    VariablesResponse,
};
use crate::Result;

/// Subscribes to every event regardless of name.
pub const ALL_EVENTS: &str = "*";

type ResponseSender = oneshot::Sender<Result<Response>>;

struct Subscriber {
    id: u64,
    event: String,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct ClientState {
    closed: bool,
    pending: HashMap<u64, ResponseSender>,
    subscribers: Vec<Subscriber>,
}

impl ClientState {
    /// Fails every waiter and ends every subscription.
    fn shut(&mut self) -> usize {
        self.closed = true;
        let failed = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(DapError::TransportClosed));
        }
        self.subscribers.clear();
        failed
    }
}

struct Shared {
    next_seq: AtomicU64,
    state: Mutex<ClientState>,
    writer: Mutex<WriteHalf>,
}

impl Shared {
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn write(&self, message: &ProtocolMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await
    }
}

/// Handle for a request that has been written but not yet answered.
#[derive(Debug)]
pub struct PendingRequest {
    seq: u64,
    command: String,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingRequest {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Stream of events for one subscription. Ends when the connection closes
/// or the subscription is removed.
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

pub struct ProtocolClient {
    shared: Arc<Shared>,
    transport: Mutex<Box<dyn Transport>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    next_subscription: AtomicU64,
    config: DapConfig,
    description: String,
}

impl ProtocolClient {
    /// Takes over `transport` and starts reading from it.
    pub fn new(mut transport: Box<dyn Transport>, config: &DapConfig) -> Result<Self> {
        let (reader, writer) = transport
            .take_io()
            .ok_or_else(|| DapError::Transport("transport is already in use".into()))?;
        let description = transport.describe();

        let shared = Arc::new(Shared {
            next_seq: AtomicU64::new(1),
            state: Mutex::new(ClientState::default()),
            writer: Mutex::new(writer),
        });
        let reader_task = spawn_reader(reader, shared.clone(), description.clone());
        debug!(transport = %description, "protocol client started");

        Ok(Self {
            shared,
            transport: Mutex::new(transport),
            reader_task: Mutex::new(Some(reader_task)),
            next_subscription: AtomicU64::new(1),
            config: config.clone(),
            description,
        })
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.state.lock().await.closed
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    /// Registers interest in `event` (or [`ALL_EVENTS`]). Delivery follows
    /// subscription order.
    pub async fn subscribe(&self, event: &str) -> EventSubscription {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock().await;
        if !state.closed {
            state.subscribers.push(Subscriber {
                id,
                event: event.to_string(),
                tx,
            });
        }
        EventSubscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut state = self.shared.state.lock().await;
        state.subscribers.retain(|s| s.id != id);
    }

    /// Writes a request and registers it in the pending table.
    pub async fn send_request_begin(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<PendingRequest> {
        let seq = self.shared.next_seq();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(DapError::TransportClosed);
            }
            state.pending.insert(seq, tx);
        }

        let message = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        });
        trace!(seq, command, "sending request");
        if let Err(e) = self.shared.write(&message).await {
            self.shared.state.lock().await.pending.remove(&seq);
            return Err(DapError::Transport(format!(
                "Failed to send request '{command}': {e}"
            )));
        }

        Ok(PendingRequest {
            seq,
            command: command.to_string(),
            rx,
        })
    }

    /// Waits for the response to `pending`. A timeout abandons only this
    /// request; the connection stays open.
    pub async fn await_response(
        &self,
        pending: PendingRequest,
        wait_timeout: Duration,
    ) -> Result<Response> {
        let PendingRequest { seq, command, rx } = pending;
        let response = match timeout(wait_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(DapError::TransportClosed),
            Err(_) => {
                self.shared.state.lock().await.pending.remove(&seq);
                warn!(seq, command = %command, "request timed out");
                return Err(DapError::Timeout {
                    command,
                    after: wait_timeout,
                });
            }
        };

        if !response.success {
            return Err(DapError::adapter(command, response.error_message()));
        }
        Ok(response)
    }

    #[tracing::instrument(skip(self, arguments), fields(transport = %self.description))]
    pub async fn request_with_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        wait_timeout: Duration,
    ) -> Result<Response> {
        let pending = self.send_request_begin(command, arguments).await?;
        self.await_response(pending, wait_timeout).await
    }

    pub async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        self.request_with_timeout(command, arguments, self.config.request_timeout)
            .await
    }

    async fn request_body<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T> {
        let response = self.request(command, arguments).await?;
        parse_body(response)
    }

    pub async fn initialize(&self, adapter_id: &str) -> Result<Capabilities> {
        let arguments = serde_json::to_value(InitializeArguments::new(adapter_id))?;
        let response = self
            .request_with_timeout("initialize", Some(arguments), self.config.initialize_timeout)
            .await?;
        parse_body(response)
    }

    /// Sends `launch`/`attach` without waiting; many adapters answer only
    /// after `configurationDone`.
    pub async fn start_begin(&self, mode: RequestMode, arguments: Value) -> Result<PendingRequest> {
        self.send_request_begin(mode.command(), Some(arguments)).await
    }

    pub async fn finish(&self, pending: PendingRequest) -> Result<Response> {
        self.await_response(pending, self.config.request_timeout)
            .await
    }

    pub async fn launch(&self, arguments: Value) -> Result<()> {
        self.request("launch", Some(arguments)).await.map(drop)
    }

    pub async fn attach(&self, arguments: Value) -> Result<()> {
        self.request("attach", Some(arguments)).await.map(drop)
    }

    pub async fn configuration_done(&self) -> Result<()> {
        self.request("configurationDone", None).await.map(drop)
    }

    pub async fn set_breakpoints(
        &self,
        path: &Path,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Result<Vec<Breakpoint>> {
        let arguments = serde_json::to_value(SetBreakpointsArguments {
            source: Source::from_path(path),
            breakpoints,
            source_modified: false,
        })?;
        let body: SetBreakpointsResponse =
            self.request_body("setBreakpoints", Some(arguments)).await?;
        Ok(body.breakpoints)
    }

    pub async fn continue_(&self, thread_id: i64) -> Result<()> {
        self.request("continue", Some(json!({ "threadId": thread_id })))
            .await
            .map(drop)
    }

    pub async fn pause(&self, thread_id: i64) -> Result<()> {
        self.request("pause", Some(json!({ "threadId": thread_id })))
            .await
            .map(drop)
    }

    pub async fn next(&self, thread_id: i64) -> Result<()> {
        self.request("next", Some(json!({ "threadId": thread_id })))
            .await
            .map(drop)
    }

    pub async fn step_in(&self, thread_id: i64) -> Result<()> {
        self.request("stepIn", Some(json!({ "threadId": thread_id })))
            .await
            .map(drop)
    }

    pub async fn step_out(&self, thread_id: i64) -> Result<()> {
        self.request("stepOut", Some(json!({ "threadId": thread_id })))
            .await
            .map(drop)
    }

    pub async fn restart_frame(&self, frame_id: i64) -> Result<()> {
        self.request("restartFrame", Some(json!({ "frameId": frame_id })))
            .await
            .map(drop)
    }

    pub async fn restart(&self, arguments: Option<Value>) -> Result<()> {
        let arguments = arguments.map(|a| json!({ "arguments": a }));
        self.request("restart", arguments).await.map(drop)
    }

    pub async fn terminate(&self) -> Result<()> {
        self.request_with_timeout("terminate", None, self.config.disconnect_timeout)
            .await
            .map(drop)
    }

    pub async fn disconnect(&self, terminate_debuggee: bool) -> Result<()> {
        self.request_with_timeout(
            "disconnect",
            Some(json!({ "restart": false, "terminateDebuggee": terminate_debuggee })),
            self.config.disconnect_timeout,
        )
        .await
        .map(drop)
    }

    pub async fn threads(&self) -> Result<Vec<Thread>> {
        let body: ThreadsResponse = self.request_body("threads", None).await?;
        Ok(body.threads)
    }

    pub async fn stack_trace(&self, thread_id: i64, levels: Option<u32>) -> Result<Vec<StackFrame>> {
        let mut arguments = json!({ "threadId": thread_id, "startFrame": 0 });
        if let Some(levels) = levels {
            arguments["levels"] = json!(levels);
        }
        let body: StackTraceResponse = self.request_body("stackTrace", Some(arguments)).await?;
        Ok(body.stack_frames)
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        let body: ScopesResponse = self
            .request_body("scopes", Some(json!({ "frameId": frame_id })))
            .await?;
        Ok(body.scopes)
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>> {
        let body: VariablesResponse = self
            .request_body(
                "variables",
                Some(json!({ "variablesReference": variables_reference })),
            )
            .await?;
        Ok(body.variables)
    }

    pub async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> Result<SetVariableResponse> {
        self.request_body(
            "setVariable",
            Some(json!({
                "variablesReference": variables_reference,
                "name": name,
                "value": value,
            })),
        )
        .await
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<EvaluateResponse> {
        let mut arguments = json!({ "expression": expression, "context": context });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        self.request_body("evaluate", Some(arguments)).await
    }

    /// Fails every in-flight request, ends all subscriptions and releases
    /// the transport. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let failed = self.shared.state.lock().await.shut();
        if failed > 0 {
            debug!(failed, "failed in-flight requests on close");
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.transport.lock().await.close().await
    }
}

fn parse_body<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.body.unwrap_or_else(|| json!({}));
    serde_json::from_value(body).map_err(|e| {
        DapError::Protocol(format!(
            "malformed '{}' response body: {e}",
            response.command
        ))
    })
}

/// Shuts the client state when the reader task ends, including by panic
/// or abort.
struct ReaderGuard {
    shared: Arc<Shared>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.try_lock() {
            let failed = state.shut();
            debug!(failed, "reader stopped, pending requests failed");
            return;
        }
        let shared = self.shared.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let failed = shared.state.lock().await.shut();
                debug!(failed, "reader stopped, pending requests failed");
            });
        }
    }
}

fn spawn_reader(reader: ReadHalf, shared: Arc<Shared>, description: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = ReaderGuard {
            shared: shared.clone(),
        };
        let mut reader = BufReader::new(reader);
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(DapError::TransportClosed) => {
                    info!(transport = %description, "adapter closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(transport = %description, "adapter stream unreadable: {e}");
                    break;
                }
            };
            match decode_message(&frame) {
                Ok(message) => dispatch(message, &shared).await,
                Err(e) => {
                    warn!(transport = %description, bytes = frame.len(), "skipping undecodable message: {e}");
                }
            }
        }
    })
}

async fn dispatch(message: ProtocolMessage, shared: &Shared) {
    match message {
        ProtocolMessage::Response(response) => {
            let mut state = shared.state.lock().await;
            match state.pending.remove(&response.request_seq) {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => {
                    debug!(
                        request_seq = response.request_seq,
                        "response for unknown or abandoned request"
                    );
                }
            }
        }
        ProtocolMessage::Event(event) => {
            trace!(event = %event.event, "dispatching event");
            let mut state = shared.state.lock().await;
            state.subscribers.retain(|subscriber| {
                if subscriber.event != ALL_EVENTS && subscriber.event != event.event {
                    return true;
                }
                subscriber.tx.send(event.clone()).is_ok()
            });
        }
        ProtocolMessage::Request(request) => {
            // reverse requests (runInTerminal, startDebugging) are declined
            warn!(command = %request.command, "declining reverse request from adapter");
            let reply = ProtocolMessage::Response(Response {
                seq: shared.next_seq(),
                request_seq: request.seq,
                command: request.command.clone(),
                success: false,
                message: Some(format!("'{}' is not supported", request.command)),
                body: None,
            });
            if let Err(e) = shared.write(&reply).await {
                debug!("failed to decline reverse request: {e}");
            }
        }
    }
}
