use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::breakpoints::{BreakpointChange, BreakpointId, BreakpointInfo, BreakpointOptions, BreakpointStore};
use super::console::{ConsoleBuffer, ConsoleKind, ConsoleMessage, ConsoleSource};
use super::events::OrchestratorEvent;
use super::watch::{WatchExpression, WatchId, WatchList};
use super::{Session, SessionId, SessionState};
use crate::client::{EventSubscription, ProtocolClient, ALL_EVENTS};
use crate::config::{DapConfig, DebugConfig, RequestMode};
use crate::error::DapError;
use crate::protocol::Event;
use crate::registry::{AdapterKind, AdapterRegistry};
use crate::resolver::{AdapterInfo, AdapterResolver, DetectedDebugger, ResolvedAdapter};
use crate::transport::{create_transport, RemoteConnector};
use crate::types::{
    BreakpointEventBody, Capabilities, ContinuedEventBody, EvaluateResponse, ExitedEventBody,
    OutputEventBody, Scope, SetVariableResponse, StackFrame, StoppedEventBody, Thread,
    ThreadEventBody, Variable,
};
use crate::Result;

/// Frames fetched when a stop selects the top frame.
const STOP_STACK_DEPTH: u32 = 20;
const REPL_CONTEXT: &str = "repl";
const WATCH_CONTEXT: &str = "watch";

/// Owns every live session plus the breakpoints, watches and console
/// history they share.
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: DapConfig,
    resolver: Arc<AdapterResolver>,
    connector: Option<Arc<dyn RemoteConnector>>,
    registry: Mutex<Registry>,
    breakpoints: Mutex<BreakpointStore>,
    watches: Mutex<WatchList>,
    console: Mutex<ConsoleBuffer>,
    events: broadcast::Sender<OrchestratorEvent>,
}

#[derive(Default)]
struct Registry {
    sessions: Vec<Arc<SessionHandle>>,
    active: Option<SessionId>,
}

struct SessionHandle {
    id: SessionId,
    name: String,
    kind: AdapterKind,
    config: DebugConfig,
    workspace_root: Option<PathBuf>,
    adapter: Arc<ResolvedAdapter>,
    client: Arc<ProtocolClient>,
    data: Mutex<SessionData>,
}

struct SessionData {
    state: SessionState,
    capabilities: Capabilities,
    current_thread_id: Option<i64>,
    current_frame_id: Option<i64>,
    threads: Vec<Thread>,
    /// Bumped on every stop so a late command acknowledgement cannot
    /// overwrite a newer stop.
    stop_count: u64,
}

impl SessionHandle {
    async fn snapshot(&self) -> Session {
        let data = self.data.lock().await;
        Session {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: data.state,
            capabilities: data.capabilities.clone(),
            current_thread_id: data.current_thread_id,
            current_frame_id: data.current_frame_id,
            threads: data.threads.clone(),
            config: self.config.clone(),
            workspace_root: self.workspace_root.clone(),
            adapter: self.adapter.strategy.clone(),
        }
    }
}

pub struct OrchestratorBuilder {
    config: DapConfig,
    resolver: Option<Arc<AdapterResolver>>,
    connector: Option<Arc<dyn RemoteConnector>>,
}

impl OrchestratorBuilder {
    pub fn resolver(mut self, resolver: Arc<AdapterResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn remote_connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> SessionOrchestrator {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(AdapterResolver::for_host(self.config.probe_timeout)));
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        SessionOrchestrator {
            inner: Arc::new(Inner {
                console: Mutex::new(ConsoleBuffer::new(self.config.console_capacity)),
                config: self.config,
                resolver,
                connector: self.connector,
                registry: Mutex::new(Registry::default()),
                breakpoints: Mutex::new(BreakpointStore::new()),
                watches: Mutex::new(WatchList::new()),
                events,
            }),
        }
    }
}

impl SessionOrchestrator {
    pub fn new(config: DapConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: DapConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            resolver: None,
            connector: None,
        }
    }

    pub fn config(&self) -> &DapConfig {
        &self.inner.config
    }

    pub fn resolver(&self) -> &Arc<AdapterResolver> {
        &self.inner.resolver
    }

    /// Receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    // ---- sessions ----

    /// Resolves an adapter, opens a transport to it and runs the
    /// initialize/launch handshake. The session is registered (and
    /// `sessionCreated` emitted) as soon as the connection exists.
    pub async fn start_session(
        &self,
        config: DebugConfig,
        workspace_root: Option<&Path>,
    ) -> Result<Session> {
        let inner = &self.inner;
        let kind = config.kind;
        let adapter = inner.resolve_adapter(&config).await?;
        let transport =
            create_transport(&adapter, &config, inner.connector.as_deref(), &inner.config).await?;
        let client = Arc::new(ProtocolClient::new(transport, &inner.config)?);
        let events = client.subscribe(ALL_EVENTS).await;
        let initialized = client.subscribe("initialized").await;

        let handle = Arc::new(SessionHandle {
            id: SessionId::new(),
            name: config.display_name(),
            kind,
            config,
            workspace_root: workspace_root.map(Path::to_path_buf),
            adapter,
            client,
            data: Mutex::new(SessionData {
                state: SessionState::Initializing,
                capabilities: Capabilities::default(),
                current_thread_id: None,
                current_frame_id: None,
                threads: Vec::new(),
                stop_count: 0,
            }),
        });
        inner.registry.lock().await.sessions.push(handle.clone());
        info!(session = %handle.id, %kind, transport = %handle.client.describe(), "session created");
        inner.emit(OrchestratorEvent::SessionCreated {
            session: handle.id,
            name: handle.name.clone(),
            kind,
        });

        if let Err(e) = inner.handshake(&handle, initialized).await {
            warn!(session = %handle.id, "session failed to start: {e}");
            inner.teardown(&handle, &format!("failed to start: {e}")).await;
            return Err(e);
        }

        {
            let mut registry = inner.registry.lock().await;
            if registry.active.is_none() {
                registry.active = Some(handle.id);
            }
        }
        inner.transition(&handle, SessionState::Running).await;
        spawn_event_pump(Arc::downgrade(inner), handle.clone(), events);

        Ok(handle.snapshot().await)
    }

    /// Ends a session. The adapter is asked to shut down first; failures
    /// there never block the stop.
    pub async fn stop_session(&self, id: Option<SessionId>) -> Result<()> {
        let handle = self.inner.session_handle(id).await?;
        let (state, capabilities) = {
            let data = handle.data.lock().await;
            (data.state, data.capabilities.clone())
        };

        if !state.is_terminated() {
            let graceful = if capabilities.supports_terminate_request {
                handle.client.terminate().await
            } else {
                let terminate_debuggee = handle.config.request == RequestMode::Launch;
                handle.client.disconnect(terminate_debuggee).await
            };
            if let Err(e) = graceful {
                debug!(session = %handle.id, "adapter did not shut down cleanly: {e}");
            }
        }

        self.inner.teardown(&handle, "stopped by user").await;
        Ok(())
    }

    /// Restarts in place when the adapter supports it; otherwise stops the
    /// session and starts a fresh one from the same configuration.
    pub async fn restart_session(&self, id: Option<SessionId>) -> Result<Session> {
        let handle = self.inner.session_handle(id).await?;
        let supports_restart = handle.data.lock().await.capabilities.supports_restart_request;

        if supports_restart {
            let arguments = handle
                .config
                .request_arguments(AdapterRegistry::get(handle.kind));
            handle.client.restart(Some(arguments)).await?;
            info!(session = %handle.id, "session restarted in place");
            return Ok(handle.snapshot().await);
        }

        let config = handle.config.clone();
        let workspace_root = handle.workspace_root.clone();
        self.stop_session(Some(handle.id)).await?;
        info!(session = %handle.id, "restarting with a new connection");
        self.start_session(config, workspace_root.as_deref()).await
    }

    pub async fn session(&self, id: SessionId) -> Result<Session> {
        Ok(self.inner.session_handle(Some(id)).await?.snapshot().await)
    }

    pub async fn sessions(&self) -> Vec<Session> {
        let handles = self.inner.registry.lock().await.sessions.clone();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.snapshot().await);
        }
        sessions
    }

    pub async fn active_session_id(&self) -> Option<SessionId> {
        self.inner.registry.lock().await.active
    }

    pub async fn set_active_session(&self, id: SessionId) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        if !registry.sessions.iter().any(|s| s.id == id) {
            return Err(DapError::SessionNotFound(id));
        }
        registry.active = Some(id);
        Ok(())
    }

    /// Stops every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self
            .inner
            .registry
            .lock()
            .await
            .sessions
            .iter()
            .map(|s| s.id)
            .collect();
        for id in ids {
            if let Err(e) = self.stop_session(Some(id)).await {
                debug!(session = %id, "stop during shutdown failed: {e}");
            }
        }
    }

    // ---- execution ----

    pub async fn continue_(&self, id: Option<SessionId>) -> Result<()> {
        let handle = self.inner.session_handle(id).await?;
        let thread_id = self.inner.thread_for(&handle).await?;
        let stops = handle.data.lock().await.stop_count;
        handle.client.continue_(thread_id).await?;
        self.inner.mark_running(&handle, Some(thread_id), stops).await;
        Ok(())
    }

    pub async fn pause(&self, id: Option<SessionId>) -> Result<()> {
        let handle = self.inner.session_handle(id).await?;
        let thread_id = self.inner.thread_for(&handle).await?;
        handle.client.pause(thread_id).await
    }

    pub async fn step_over(&self, id: Option<SessionId>) -> Result<()> {
        let handle = self.inner.session_handle(id).await?;
        let thread_id = self.inner.thread_for(&handle).await?;
        let stops = handle.data.lock().await.stop_count;
        handle.client.next(thread_id).await?;
        self.inner.mark_running(&handle, Some(thread_id), stops).await;
        Ok(())
    }

    pub async fn step_into(&self, id: Option<SessionId>) -> Result<()> {
        let handle = self.inner.session_handle(id).await?;
        let thread_id = self.inner.thread_for(&handle).await?;
        let stops = handle.data.lock().await.stop_count;
        handle.client.step_in(thread_id).await?;
        self.inner.mark_running(&handle, Some(thread_id), stops).await;
        Ok(())
    }

    pub async fn step_out(&self, id: Option<SessionId>) -> Result<()> {
        let handle = self.inner.session_handle(id).await?;
        let thread_id = self.inner.thread_for(&handle).await?;
        let stops = handle.data.lock().await.stop_count;
        handle.client.step_out(thread_id).await?;
        self.inner.mark_running(&handle, Some(thread_id), stops).await;
        Ok(())
    }

    /// Rewinds to the start of `frame_id` (the selected frame by default).
    pub async fn restart_frame(&self, frame_id: Option<i64>, id: Option<SessionId>) -> Result<()> {
        let handle = self.inner.session_handle(id).await?;
        let (supported, current) = {
            let data = handle.data.lock().await;
            (data.capabilities.supports_restart_frame, data.current_frame_id)
        };
        if !supported {
            return Err(DapError::Unsupported("restartFrame".into()));
        }
        let frame_id = frame_id
            .or(current)
            .ok_or_else(|| DapError::user_input("No stack frame is selected"))?;
        let stops = handle.data.lock().await.stop_count;
        handle.client.restart_frame(frame_id).await?;
        self.inner.mark_running(&handle, None, stops).await;
        Ok(())
    }

    pub async fn select_thread(&self, thread_id: i64, id: Option<SessionId>) -> Result<Session> {
        let handle = self.inner.session_handle(id).await?;
        let stopped = {
            let mut data = handle.data.lock().await;
            data.current_thread_id = Some(thread_id);
            data.current_frame_id = None;
            data.state == SessionState::Stopped
        };
        if stopped {
            let frames = handle
                .client
                .stack_trace(thread_id, Some(STOP_STACK_DEPTH))
                .await?;
            handle.data.lock().await.current_frame_id = frames.first().map(|f| f.id);
        }
        Ok(handle.snapshot().await)
    }

    pub async fn select_frame(&self, frame_id: i64, id: Option<SessionId>) -> Result<Session> {
        let handle = self.inner.session_handle(id).await?;
        handle.data.lock().await.current_frame_id = Some(frame_id);
        Ok(handle.snapshot().await)
    }

    // ---- breakpoints ----

    /// Adds (or updates) the breakpoint at `path:line` and syncs the file to
    /// the active session. With no session it is only stored.
    pub async fn set_breakpoint(
        &self,
        path: &Path,
        line: u32,
        options: BreakpointOptions,
    ) -> Result<BreakpointInfo> {
        if line == 0 {
            return Err(DapError::user_input("Breakpoint lines start at 1"));
        }
        let (info, created) = self.inner.breakpoints.lock().await.add(path, line, options);
        let change = if created {
            BreakpointChange::Added
        } else {
            BreakpointChange::Updated
        };
        self.inner.emit(OrchestratorEvent::BreakpointChanged {
            change,
            breakpoint: info.clone(),
        });
        self.inner.sync_after_edit(path).await;
        Ok(self.inner.current_breakpoint(info).await)
    }

    pub async fn remove_breakpoint(&self, id: BreakpointId) -> Result<BreakpointInfo> {
        let removed = self
            .inner
            .breakpoints
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| unknown_breakpoint(id))?;
        self.inner.emit(OrchestratorEvent::BreakpointChanged {
            change: BreakpointChange::Removed,
            breakpoint: removed.clone(),
        });
        self.inner.sync_after_edit(&removed.path).await;
        Ok(removed)
    }

    pub async fn toggle_breakpoint(&self, id: BreakpointId) -> Result<BreakpointInfo> {
        let toggled = self
            .inner
            .breakpoints
            .lock()
            .await
            .toggle(id)
            .ok_or_else(|| unknown_breakpoint(id))?;
        self.inner.breakpoint_updated(toggled).await
    }

    pub async fn set_breakpoint_enabled(
        &self,
        id: BreakpointId,
        enabled: bool,
    ) -> Result<BreakpointInfo> {
        let updated = self
            .inner
            .breakpoints
            .lock()
            .await
            .set_enabled(id, enabled)
            .ok_or_else(|| unknown_breakpoint(id))?;
        self.inner.breakpoint_updated(updated).await
    }

    /// Removes every breakpoint in `path`.
    pub async fn clear_breakpoints(&self, path: &Path) -> Vec<BreakpointInfo> {
        let removed = self.inner.breakpoints.lock().await.clear_file(path);
        if removed.is_empty() {
            return removed;
        }
        for breakpoint in &removed {
            self.inner.emit(OrchestratorEvent::BreakpointChanged {
                change: BreakpointChange::Removed,
                breakpoint: breakpoint.clone(),
            });
        }
        self.inner.sync_after_edit(path).await;
        removed
    }

    pub async fn breakpoints_for_file(&self, path: &Path) -> Vec<BreakpointInfo> {
        self.inner.breakpoints.lock().await.for_file(path)
    }

    pub async fn has_breakpoints(&self, path: &Path) -> bool {
        self.inner.breakpoints.lock().await.has_file(path)
    }

    pub async fn all_breakpoints(&self) -> Vec<BreakpointInfo> {
        self.inner.breakpoints.lock().await.all()
    }

    // ---- inspection ----

    pub async fn get_threads(&self, id: Option<SessionId>) -> Result<Vec<Thread>> {
        let handle = self.inner.session_handle(id).await?;
        let threads = handle.client.threads().await?;
        handle.data.lock().await.threads = threads.clone();
        self.inner.emit(OrchestratorEvent::ThreadsUpdated {
            session: handle.id,
            threads: threads.clone(),
        });
        Ok(threads)
    }

    pub async fn get_stack_trace(
        &self,
        thread_id: Option<i64>,
        id: Option<SessionId>,
    ) -> Result<Vec<StackFrame>> {
        let handle = self.inner.session_handle(id).await?;
        let thread_id = match thread_id {
            Some(thread_id) => thread_id,
            None => self.inner.thread_for(&handle).await?,
        };
        handle.client.stack_trace(thread_id, None).await
    }

    pub async fn get_scopes(&self, frame_id: Option<i64>, id: Option<SessionId>) -> Result<Vec<Scope>> {
        let handle = self.inner.session_handle(id).await?;
        let frame_id = match frame_id {
            Some(frame_id) => frame_id,
            None => handle
                .data
                .lock()
                .await
                .current_frame_id
                .ok_or_else(|| DapError::user_input("No stack frame is selected"))?,
        };
        handle.client.scopes(frame_id).await
    }

    pub async fn get_variables(
        &self,
        variables_reference: i64,
        id: Option<SessionId>,
    ) -> Result<Vec<Variable>> {
        let handle = self.inner.session_handle(id).await?;
        handle.client.variables(variables_reference).await
    }

    pub async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
        id: Option<SessionId>,
    ) -> Result<SetVariableResponse> {
        if name.trim().is_empty() {
            return Err(DapError::user_input("Variable name is empty"));
        }
        let handle = self.inner.session_handle(id).await?;
        if !handle.data.lock().await.capabilities.supports_set_variable {
            debug!(session = %handle.id, "adapter did not advertise setVariable, trying anyway");
        }
        handle
            .client
            .set_variable(variables_reference, name, value)
            .await
    }

    /// Evaluates in `frame_id` (the selected frame by default) with
    /// `context` (`"repl"` by default).
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: Option<&str>,
        id: Option<SessionId>,
    ) -> Result<EvaluateResponse> {
        if expression.trim().is_empty() {
            return Err(DapError::user_input("Expression is empty"));
        }
        let handle = self.inner.session_handle(id).await?;
        let frame_id = match frame_id {
            Some(frame_id) => Some(frame_id),
            None => handle.data.lock().await.current_frame_id,
        };
        handle
            .client
            .evaluate(expression, frame_id, context.unwrap_or(REPL_CONTEXT))
            .await
    }

    // ---- watches ----

    pub async fn add_watch(&self, expression: &str) -> Result<WatchExpression> {
        if expression.trim().is_empty() {
            return Err(DapError::user_input("Watch expression is empty"));
        }
        let watch = self.inner.watches.lock().await.add(expression);
        self.inner.emit(OrchestratorEvent::WatchAdded {
            watch: watch.clone(),
        });

        match self.inner.stopped_active().await {
            Some(handle) => Ok(self
                .inner
                .evaluate_watch(&watch, Some(&handle))
                .await
                .unwrap_or(watch)),
            None => Ok(watch),
        }
    }

    pub async fn remove_watch(&self, id: WatchId) -> Result<WatchExpression> {
        let removed = self
            .inner
            .watches
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| DapError::user_input(format!("Unknown watch {id}")))?;
        self.inner.emit(OrchestratorEvent::WatchRemoved { id });
        Ok(removed)
    }

    /// Re-evaluates one watch. An evaluation failure lands in the watch's
    /// `error` field rather than failing the call.
    pub async fn refresh_watch(&self, id: WatchId) -> Result<WatchExpression> {
        let watch = self
            .inner
            .watches
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DapError::user_input(format!("Unknown watch {id}")))?;
        let target = self.inner.active_handle().await;
        Ok(self
            .inner
            .evaluate_watch(&watch, target.as_ref())
            .await
            .unwrap_or(watch))
    }

    pub async fn refresh_watches(&self) -> Vec<WatchExpression> {
        let target = self.inner.active_handle().await;
        self.inner.refresh_all_watches(target.as_ref()).await
    }

    pub async fn watches(&self) -> Vec<WatchExpression> {
        self.inner.watches.lock().await.all()
    }

    // ---- console ----

    /// Records `command` as input, evaluates it in the active session and
    /// records the outcome. Failures are recorded and returned.
    pub async fn execute_in_console(&self, command: &str) -> Result<String> {
        self.inner
            .push_console(ConsoleMessage::new(ConsoleKind::Input, command))
            .await;

        match self.evaluate(command, None, Some(REPL_CONTEXT), None).await {
            Ok(response) => {
                self.inner
                    .push_console(ConsoleMessage::new(ConsoleKind::Output, response.result.clone()))
                    .await;
                Ok(response.result)
            }
            Err(e) => {
                self.inner
                    .push_console(ConsoleMessage::new(ConsoleKind::Error, e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn console_messages(&self) -> Vec<ConsoleMessage> {
        self.inner.console.lock().await.snapshot()
    }

    pub async fn clear_console(&self) {
        self.inner.console.lock().await.clear();
    }

    // ---- adapters ----

    pub async fn list_adapters(&self) -> Vec<AdapterInfo> {
        self.inner.resolver.list_available().await
    }

    pub async fn detect_debuggers(&self, workspace_root: &Path) -> Vec<DetectedDebugger> {
        self.inner.resolver.detect(workspace_root).await
    }

    pub async fn clear_adapter_cache(&self) {
        self.inner.resolver.clear_cache().await;
    }
}

impl Inner {
    fn emit(&self, event: OrchestratorEvent) {
        trace!(event = event.name(), "orchestrator event");
        // no receivers is fine
        let _ = self.events.send(event);
    }

    async fn resolve_adapter(&self, config: &DebugConfig) -> Result<Arc<ResolvedAdapter>> {
        let kind = config.kind;
        if let Some(port) = config.debug_server {
            return Ok(Arc::new(ResolvedAdapter::server(kind, "127.0.0.1", port)));
        }
        if let Some(path) = &config.adapter_path {
            return Ok(Arc::new(ResolvedAdapter::from_path(kind, path.clone())));
        }
        self.resolver
            .resolve(kind)
            .await
            .ok_or(DapError::Resolution { kind })
    }

    async fn handshake(
        &self,
        handle: &Arc<SessionHandle>,
        mut initialized: EventSubscription,
    ) -> Result<()> {
        let client = &handle.client;
        let capabilities = client.initialize(handle.kind.id()).await?;
        handle.data.lock().await.capabilities = capabilities.clone();

        let arguments = handle
            .config
            .request_arguments(AdapterRegistry::get(handle.kind));
        let start = client.start_begin(handle.config.request, arguments).await?;

        match timeout(self.config.initialized_event_timeout, initialized.recv()).await {
            Ok(Some(_)) => debug!(session = %handle.id, "adapter initialized"),
            Ok(None) => return Err(DapError::TransportClosed),
            Err(_) => debug!(session = %handle.id, "no initialized event, configuring anyway"),
        }
        client.unsubscribe(initialized.id()).await;

        let files = self.breakpoints.lock().await.files();
        for path in files {
            if let Err(e) = self.sync_file(Some(handle.clone()), &path).await {
                if e.is_transport_failure() {
                    return Err(e);
                }
                warn!(session = %handle.id, path = %path.display(), "initial breakpoint sync failed: {e}");
            }
        }

        if capabilities.supports_configuration_done_request {
            client.configuration_done().await?;
        }
        client.finish(start).await?;
        Ok(())
    }

    async fn session_handle(&self, id: Option<SessionId>) -> Result<Arc<SessionHandle>> {
        let registry = self.registry.lock().await;
        let id = match id {
            Some(id) => id,
            None => registry.active.ok_or(DapError::NoActiveSession)?,
        };
        registry
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(DapError::SessionNotFound(id))
    }

    async fn active_handle(&self) -> Option<Arc<SessionHandle>> {
        self.session_handle(None).await.ok()
    }

    async fn stopped_active(&self) -> Option<Arc<SessionHandle>> {
        let handle = self.active_handle().await?;
        let stopped = handle.data.lock().await.state == SessionState::Stopped;
        stopped.then_some(handle)
    }

    /// Applies a state change if the state machine allows it. Returns the
    /// previous state when applied.
    async fn transition(
        &self,
        handle: &SessionHandle,
        next: SessionState,
    ) -> Option<SessionState> {
        let previous = apply_transition(handle.id, &mut *handle.data.lock().await, next);
        self.announce_transition(handle, previous, next);
        previous
    }

    fn announce_transition(
        &self,
        handle: &SessionHandle,
        previous: Option<SessionState>,
        next: SessionState,
    ) {
        match previous {
            Some(previous) if previous != next => {
                debug!(session = %handle.id, from = %previous, to = %next, "session state changed");
                self.emit(OrchestratorEvent::SessionStateChanged {
                    session: handle.id,
                    state: next,
                });
            }
            _ => {}
        }
    }

    /// Moves a stopped session back to running after an acknowledged
    /// command, unless a newer stop arrived meanwhile.
    async fn mark_running(&self, handle: &SessionHandle, thread_id: Option<i64>, stops_before: u64) {
        let previous = {
            let mut data = handle.data.lock().await;
            if data.stop_count != stops_before {
                return;
            }
            apply_transition(handle.id, &mut data, SessionState::Running)
        };
        self.announce_transition(handle, previous, SessionState::Running);
        if previous == Some(SessionState::Stopped) {
            self.emit(OrchestratorEvent::Continued {
                session: handle.id,
                thread_id,
            });
        }
    }

    /// Thread for execution commands: the selected one, else the first
    /// known thread, else the first thread the adapter reports.
    async fn thread_for(&self, handle: &SessionHandle) -> Result<i64> {
        {
            let data = handle.data.lock().await;
            if let Some(thread_id) = data.current_thread_id.or(data.threads.first().map(|t| t.id)) {
                return Ok(thread_id);
            }
        }
        let threads = handle.client.threads().await?;
        let first = threads.first().map(|t| t.id);
        {
            let mut data = handle.data.lock().await;
            data.threads = threads;
            data.current_thread_id = first;
        }
        first.ok_or_else(|| DapError::user_input("No thread is available for this command"))
    }

    /// Marks a session terminated, drops it from the registry and closes
    /// its connection. Later calls are no-ops.
    async fn teardown(&self, handle: &SessionHandle, reason: &str) {
        {
            let mut data = handle.data.lock().await;
            if data.state.is_terminated() {
                return;
            }
            data.state = SessionState::Terminated;
        }

        let remaining = {
            let mut registry = self.registry.lock().await;
            registry.sessions.retain(|s| s.id != handle.id);
            if registry.active == Some(handle.id) {
                registry.active = registry.sessions.first().map(|s| s.id);
                if let Some(next) = registry.active {
                    debug!(session = %next, "promoted to active session");
                }
            }
            registry.sessions.len()
        };

        if let Err(e) = handle.client.close().await {
            warn!(session = %handle.id, "failed to close adapter connection: {e}");
        }
        if remaining == 0 {
            self.breakpoints.lock().await.reset_verification();
        }

        info!(session = %handle.id, reason, "session terminated");
        self.emit(OrchestratorEvent::SessionStateChanged {
            session: handle.id,
            state: SessionState::Terminated,
        });
        self.emit(OrchestratorEvent::SessionTerminated {
            session: handle.id,
            reason: reason.to_string(),
        });
    }

    /// Sends the full enabled set for `path` to `target` (the active
    /// session by default) and reconciles the answer.
    async fn sync_file(&self, target: Option<Arc<SessionHandle>>, path: &Path) -> Result<()> {
        let target = match target {
            Some(handle) => handle,
            None => match self.active_handle().await {
                Some(handle) => handle,
                None => return Ok(()),
            },
        };
        if target.data.lock().await.state.is_terminated() {
            return Ok(());
        }

        let (ids, requests): (Vec<_>, Vec<_>) = self
            .breakpoints
            .lock()
            .await
            .enabled_requests(path)
            .into_iter()
            .unzip();
        debug!(session = %target.id, path = %path.display(), count = requests.len(), "syncing breakpoints");
        let results = target.client.set_breakpoints(path, requests).await?;
        let changed = self.breakpoints.lock().await.reconcile(path, &ids, &results);
        for breakpoint in changed {
            self.emit(OrchestratorEvent::BreakpointValidated { breakpoint });
        }
        Ok(())
    }

    async fn sync_after_edit(&self, path: &Path) {
        if let Err(e) = self.sync_file(None, path).await {
            warn!(path = %path.display(), "breakpoint sync failed: {e}");
        }
    }

    async fn breakpoint_updated(&self, breakpoint: BreakpointInfo) -> Result<BreakpointInfo> {
        self.emit(OrchestratorEvent::BreakpointChanged {
            change: BreakpointChange::Updated,
            breakpoint: breakpoint.clone(),
        });
        self.sync_after_edit(&breakpoint.path).await;
        Ok(self.current_breakpoint(breakpoint).await)
    }

    async fn current_breakpoint(&self, fallback: BreakpointInfo) -> BreakpointInfo {
        self.breakpoints
            .lock()
            .await
            .get(fallback.id)
            .cloned()
            .unwrap_or(fallback)
    }

    async fn evaluate_watch(
        &self,
        watch: &WatchExpression,
        target: Option<&Arc<SessionHandle>>,
    ) -> Option<WatchExpression> {
        let outcome = match target {
            Some(handle) => {
                let frame_id = handle.data.lock().await.current_frame_id;
                handle
                    .client
                    .evaluate(&watch.expression, frame_id, WATCH_CONTEXT)
                    .await
                    .map_err(|e| e.to_string())
            }
            None => Err(DapError::NoActiveSession.to_string()),
        };
        let updated = self.watches.lock().await.record(watch.id, outcome)?;
        self.emit(OrchestratorEvent::WatchUpdated {
            watch: updated.clone(),
        });
        Some(updated)
    }

    async fn refresh_all_watches(&self, target: Option<&Arc<SessionHandle>>) -> Vec<WatchExpression> {
        let watches = self.watches.lock().await.all();
        let mut refreshed = Vec::with_capacity(watches.len());
        for watch in watches {
            if let Some(updated) = self.evaluate_watch(&watch, target).await {
                refreshed.push(updated);
            }
        }
        refreshed
    }

    async fn push_console(&self, message: ConsoleMessage) {
        self.console.lock().await.push(message.clone());
        self.emit(OrchestratorEvent::ConsoleMessage { message });
    }

    /// Reacts to one adapter event. Returns `false` once the session is
    /// over.
    async fn handle_adapter_event(&self, handle: &Arc<SessionHandle>, event: Event) -> bool {
        match event.event.as_str() {
            "stopped" => {
                if let Some(body) = event_body::<StoppedEventBody>(&event) {
                    self.on_stopped(handle, body).await;
                }
            }
            "continued" => {
                let body = event_body::<ContinuedEventBody>(&event).unwrap_or_default();
                let stops = handle.data.lock().await.stop_count;
                self.mark_running(handle, Some(body.thread_id), stops).await;
            }
            "terminated" => {
                self.teardown(handle, "adapter terminated the session").await;
                return false;
            }
            "exited" => {
                if let Some(body) = event_body::<ExitedEventBody>(&event) {
                    self.push_console(ConsoleMessage::new(
                        ConsoleKind::Info,
                        format!("Process exited with code {}", body.exit_code),
                    ))
                    .await;
                }
            }
            "output" => {
                if let Some(body) = event_body::<OutputEventBody>(&event) {
                    self.on_output(handle, body).await;
                }
            }
            "breakpoint" => {
                if let Some(body) = event_body::<BreakpointEventBody>(&event) {
                    let updated = self
                        .breakpoints
                        .lock()
                        .await
                        .apply_adapter_update(&body.reason, &body.breakpoint);
                    if let Some(breakpoint) = updated {
                        if breakpoint.verified {
                            self.emit(OrchestratorEvent::BreakpointValidated { breakpoint });
                        } else {
                            self.emit(OrchestratorEvent::BreakpointChanged {
                                change: BreakpointChange::Updated,
                                breakpoint,
                            });
                        }
                    }
                }
            }
            "thread" => {
                if let Some(body) = event_body::<ThreadEventBody>(&event) {
                    self.on_thread(handle, body).await;
                }
            }
            "initialized" => {}
            other => trace!(session = %handle.id, event = other, "unhandled adapter event"),
        }
        true
    }

    async fn on_stopped(&self, handle: &Arc<SessionHandle>, body: StoppedEventBody) {
        let previous = {
            let mut data = handle.data.lock().await;
            data.stop_count += 1;
            apply_transition(handle.id, &mut data, SessionState::Stopped)
        };
        self.announce_transition(handle, previous, SessionState::Stopped);

        match handle.client.threads().await {
            Ok(threads) => {
                handle.data.lock().await.threads = threads.clone();
                self.emit(OrchestratorEvent::ThreadsUpdated {
                    session: handle.id,
                    threads,
                });
            }
            Err(e) => warn!(session = %handle.id, "failed to refresh threads after stop: {e}"),
        }

        let thread_id = {
            let data = handle.data.lock().await;
            body.thread_id
                .or(data.current_thread_id)
                .or(data.threads.first().map(|t| t.id))
        };
        let mut frame_id = None;
        if let Some(thread_id) = thread_id {
            match handle
                .client
                .stack_trace(thread_id, Some(STOP_STACK_DEPTH))
                .await
            {
                Ok(frames) => frame_id = frames.first().map(|f| f.id),
                Err(e) => warn!(session = %handle.id, thread_id, "failed to fetch stack after stop: {e}"),
            }
        }
        {
            let mut data = handle.data.lock().await;
            data.current_thread_id = thread_id;
            data.current_frame_id = frame_id;
        }

        info!(session = %handle.id, reason = %body.reason, ?thread_id, "session stopped");
        self.emit(OrchestratorEvent::Stopped {
            session: handle.id,
            reason: body.reason,
            description: body.description,
            thread_id,
            frame_id,
        });
        self.refresh_all_watches(Some(handle)).await;
    }

    async fn on_output(&self, handle: &SessionHandle, body: OutputEventBody) {
        self.emit(OrchestratorEvent::Output {
            session: handle.id,
            category: body.category.clone(),
            output: body.output.clone(),
        });
        let Some(kind) = ConsoleKind::from_category(body.category.as_deref()) else {
            return;
        };
        let source = body
            .source
            .and_then(|s| s.path)
            .map(|path| ConsoleSource {
                path,
                line: body.line,
            });
        self.push_console(ConsoleMessage::new(kind, body.output).with_source(source))
            .await;
    }

    async fn on_thread(&self, handle: &SessionHandle, body: ThreadEventBody) {
        let threads = {
            let mut data = handle.data.lock().await;
            match body.reason.as_str() {
                "started" => {
                    if !data.threads.iter().any(|t| t.id == body.thread_id) {
                        data.threads.push(Thread {
                            id: body.thread_id,
                            name: format!("Thread {}", body.thread_id),
                        });
                    }
                }
                "exited" => {
                    data.threads.retain(|t| t.id != body.thread_id);
                    if data.current_thread_id == Some(body.thread_id) {
                        data.current_thread_id = None;
                        data.current_frame_id = None;
                    }
                }
                _ => return,
            }
            data.threads.clone()
        };
        self.emit(OrchestratorEvent::ThreadsUpdated {
            session: handle.id,
            threads,
        });
    }
}

/// State-machine step on locked session data. Returns the previous state
/// when the change is allowed.
fn apply_transition(
    session: SessionId,
    data: &mut SessionData,
    next: SessionState,
) -> Option<SessionState> {
    if !data.state.can_transition_to(next) {
        debug!(%session, from = %data.state, to = %next, "ignoring state change");
        return None;
    }
    Some(std::mem::replace(&mut data.state, next))
}

fn spawn_event_pump(inner: Weak<Inner>, handle: Arc<SessionHandle>, mut events: EventSubscription) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if !inner.handle_adapter_event(&handle, event).await {
                return;
            }
        }
        if let Some(inner) = inner.upgrade() {
            inner.teardown(&handle, "adapter connection closed").await;
        }
    });
}

fn event_body<T: DeserializeOwned>(event: &Event) -> Option<T> {
    let body = event.body.clone().unwrap_or_else(|| json!({}));
    match serde_json::from_value(body) {
        Ok(body) => Some(body),
        Err(e) => {
            warn!(event = %event.event, "malformed event body: {e}");
            None
        }
    }
}

fn unknown_breakpoint(id: BreakpointId) -> DapError {
    DapError::user_input(format!("Unknown breakpoint {id}"))
}
