use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use dap_core::{
    AdapterKind, BreakpointOptions, DapConfig, DapError, DebugConfig, OrchestratorEvent,
    RequestMode, SessionId, SessionOrchestrator,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{broadcast, Mutex},
};
use tracing_subscriber::EnvFilter;

const DEFAULT_AUDIT_DIR: &str = ".debugger/audit";

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SessionParams {
    /// Target session; the active session when omitted.
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStartParams {
    /// Adapter kind: debugpy, codelldb, lldb-dap, gdb, js-debug or delve.
    kind: String,
    #[serde(default)]
    name: Option<String>,
    /// "launch" (default) or "attach".
    #[serde(default)]
    request: Option<String>,
    #[serde(default)]
    program: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    process_id: Option<u32>,
    #[serde(default)]
    stop_on_entry: Option<bool>,
    #[serde(default)]
    adapter_path: Option<String>,
    #[serde(default)]
    debug_server: Option<u16>,
    #[serde(default)]
    workspace_root: Option<String>,
    /// Adapter-specific launch fields passed through unchanged.
    #[serde(default)]
    extra: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerDetectParams {
    workspace_root: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSelectSessionParams {
    session_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSelectThreadParams {
    thread_id: i64,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerFrameParams {
    #[serde(default)]
    frame_id: Option<i64>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSetBreakpointParams {
    source_path: String,
    line: u32,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    hit_condition: Option<String>,
    #[serde(default)]
    log_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerBreakpointIdParams {
    breakpoint_id: u64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerBreakpointEnabledParams {
    breakpoint_id: u64,
    enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSourceParams {
    #[serde(default)]
    source_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStackTraceParams {
    #[serde(default)]
    thread_id: Option<i64>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerVariablesParams {
    variables_reference: i64,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSetVariableParams {
    variables_reference: i64,
    name: String,
    value: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerEvaluateParams {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerWatchParams {
    expression: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerWatchIdParams {
    watch_id: u64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerConsoleParams {
    command: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerConsoleHistoryParams {
    #[serde(default)]
    clear: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct EmptyParams {}

/// Appends every orchestrator event to a JSONL file.
struct AuditLogger {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl AuditLogger {
    async fn new(dir: &Path) -> Result<Self, String> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| format!("Failed to create audit directory: {e}"))?;

        let filename = format!(
            "debug_events_{}_{}.jsonl",
            std::process::id(),
            timestamp_millis()
        );
        let path = dir.join(filename);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| format!("Failed to open audit log file: {e}"))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    async fn log(&self, event: &OrchestratorEvent) -> Result<(), String> {
        let envelope = json!({
            "ts_ms": timestamp_millis(),
            "session": event.session(),
            "event": event,
        });
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| format!("Failed to serialize audit line: {e}"))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| format!("Failed to write audit log line: {e}"))?;
        file.flush()
            .await
            .map_err(|e| format!("Failed to flush audit log file: {e}"))?;

        Ok(())
    }
}

fn spawn_audit_pump(audit: Arc<AuditLogger>, mut events: broadcast::Receiver<OrchestratorEvent>) {
    tokio::spawn(async move {
        tracing::info!(path = %audit.path.display(), "writing audit log");
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = audit.log(&event).await {
                        tracing::warn!("{e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "audit log fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn audit_dir() -> PathBuf {
    std::env::var("DEBUGGER_AUDIT_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_DIR))
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn to_mcp_error(error: DapError) -> McpError {
    match error {
        DapError::UserInput(_) | DapError::SessionNotFound(_) | DapError::NoActiveSession => {
            McpError::invalid_params(error.to_string(), None)
        }
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn structured<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let value = serde_json::to_value(value)
        .map_err(|e| McpError::internal_error(format!("Failed to serialize result: {e}"), None))?;
    Ok(CallToolResult::structured(value))
}

fn parse_session_id(raw: Option<&str>) -> Result<Option<SessionId>, McpError> {
    raw.map(SessionId::from_str).transpose().map_err(to_mcp_error)
}

fn debug_config(params: DebuggerStartParams) -> Result<DebugConfig, McpError> {
    let kind = AdapterKind::from_str(params.kind.trim())
        .map_err(|e| McpError::invalid_params(e, None))?;
    let request = match params.request.as_deref() {
        None | Some("launch") => RequestMode::Launch,
        Some("attach") => RequestMode::Attach,
        Some(other) => {
            return Err(McpError::invalid_params(
                format!("request must be 'launch' or 'attach', got '{other}'"),
                None,
            ))
        }
    };

    let mut config = match (request, params.process_id) {
        (RequestMode::Attach, Some(pid)) => DebugConfig::attach(kind, pid),
        _ => DebugConfig::launch(kind, params.program.clone().unwrap_or_default()),
    };
    config.request = request;
    config.name = params.name;
    if params.program.is_some() {
        config.program = params.program;
    }
    config.args = params.args;
    config.cwd = params.cwd.map(PathBuf::from);
    config.env = params.env;
    config.process_id = params.process_id;
    config.stop_on_entry = params.stop_on_entry;
    config.adapter_path = params.adapter_path.map(PathBuf::from);
    config.debug_server = params.debug_server;
    config.extra = params.extra.unwrap_or_default();
    Ok(config)
}

#[derive(Clone)]
struct DebuggerMcpServer {
    tool_router: ToolRouter<Self>,
    orchestrator: Arc<SessionOrchestrator>,
}

#[tool_router]
impl DebuggerMcpServer {
    fn new(orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            orchestrator,
        }
    }

    #[tool(description = "List known debug adapters and whether each is installed")]
    async fn debugger_list_adapters(
        &self,
        _params: Parameters<EmptyParams>,
    ) -> Result<CallToolResult, McpError> {
        let adapters = self.orchestrator.list_adapters().await;
        structured(&json!({ "adapters": adapters }))
    }

    #[tool(description = "Suggest debuggers for a workspace from its top-level files")]
    async fn debugger_detect(
        &self,
        params: Parameters<DebuggerDetectParams>,
    ) -> Result<CallToolResult, McpError> {
        let detected = self
            .orchestrator
            .detect_debuggers(Path::new(&params.0.workspace_root))
            .await;
        structured(&json!({ "detected": detected }))
    }

    #[tool(description = "Forget cached adapter lookups so the next start probes again")]
    async fn debugger_clear_adapter_cache(
        &self,
        _params: Parameters<EmptyParams>,
    ) -> Result<CallToolResult, McpError> {
        self.orchestrator.clear_adapter_cache().await;
        structured(&json!({ "ok": true }))
    }

    #[tool(description = "Start a debug session from a launch or attach configuration")]
    async fn debugger_start(
        &self,
        params: Parameters<DebuggerStartParams>,
    ) -> Result<CallToolResult, McpError> {
        let workspace_root = params.0.workspace_root.clone().map(PathBuf::from);
        let config = debug_config(params.0)?;
        let session = self
            .orchestrator
            .start_session(config, workspace_root.as_deref())
            .await
            .map_err(to_mcp_error)?;
        structured(&session)
    }

    #[tool(description = "Stop a debug session")]
    async fn debugger_stop(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        self.orchestrator.stop_session(id).await.map_err(to_mcp_error)?;
        structured(&json!({ "ok": true, "state": "terminated" }))
    }

    #[tool(description = "Restart a debug session")]
    async fn debugger_restart(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        let session = self
            .orchestrator
            .restart_session(id)
            .await
            .map_err(to_mcp_error)?;
        structured(&session)
    }

    #[tool(description = "List live debug sessions and the active one")]
    async fn debugger_sessions(
        &self,
        _params: Parameters<EmptyParams>,
    ) -> Result<CallToolResult, McpError> {
        let sessions = self.orchestrator.sessions().await;
        let active = self.orchestrator.active_session_id().await;
        structured(&json!({ "active": active, "sessions": sessions }))
    }

    #[tool(description = "Make a session the target of commands without a session_id")]
    async fn debugger_select_session(
        &self,
        params: Parameters<DebuggerSelectSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = SessionId::from_str(&params.0.session_id).map_err(to_mcp_error)?;
        self.orchestrator
            .set_active_session(id)
            .await
            .map_err(to_mcp_error)?;
        structured(&json!({ "ok": true, "active": id }))
    }

    #[tool(description = "Continue execution")]
    async fn debugger_continue(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        self.orchestrator.continue_(id).await.map_err(to_mcp_error)?;
        structured(&json!({ "ok": true, "state": "running" }))
    }

    #[tool(description = "Pause execution")]
    async fn debugger_pause(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        self.orchestrator.pause(id).await.map_err(to_mcp_error)?;
        structured(&json!({ "ok": true }))
    }

    #[tool(description = "Step over the next line")]
    async fn debugger_step_over(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        self.orchestrator.step_over(id).await.map_err(to_mcp_error)?;
        structured(&json!({ "ok": true }))
    }

    #[tool(description = "Step into function call")]
    async fn debugger_step_in(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        self.orchestrator.step_into(id).await.map_err(to_mcp_error)?;
        structured(&json!({ "ok": true }))
    }

    #[tool(description = "Step out of current function")]
    async fn debugger_step_out(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        self.orchestrator.step_out(id).await.map_err(to_mcp_error)?;
        structured(&json!({ "ok": true }))
    }

    #[tool(description = "Restart execution from the start of a stack frame")]
    async fn debugger_restart_frame(
        &self,
        params: Parameters<DebuggerFrameParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        self.orchestrator
            .restart_frame(params.0.frame_id, id)
            .await
            .map_err(to_mcp_error)?;
        structured(&json!({ "ok": true }))
    }

    #[tool(description = "Select the thread later commands act on")]
    async fn debugger_select_thread(
        &self,
        params: Parameters<DebuggerSelectThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        let session = self
            .orchestrator
            .select_thread(params.0.thread_id, id)
            .await
            .map_err(to_mcp_error)?;
        structured(&session)
    }

    #[tool(description = "Select the stack frame used for scopes and evaluation")]
    async fn debugger_select_frame(
        &self,
        params: Parameters<DebuggerFrameParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        let frame_id = params
            .0
            .frame_id
            .ok_or_else(|| McpError::invalid_params("frame_id is required", None))?;
        let session = self
            .orchestrator
            .select_frame(frame_id, id)
            .await
            .map_err(to_mcp_error)?;
        structured(&session)
    }

    #[tool(description = "Set a source breakpoint, optionally conditional or a logpoint")]
    async fn debugger_set_breakpoint(
        &self,
        params: Parameters<DebuggerSetBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let options = BreakpointOptions {
            condition: params.condition,
            hit_condition: params.hit_condition,
            log_message: params.log_message,
        };
        let breakpoint = self
            .orchestrator
            .set_breakpoint(Path::new(&params.source_path), params.line, options)
            .await
            .map_err(to_mcp_error)?;
        structured(&breakpoint)
    }

    #[tool(description = "Remove a breakpoint by id")]
    async fn debugger_remove_breakpoint(
        &self,
        params: Parameters<DebuggerBreakpointIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let removed = self
            .orchestrator
            .remove_breakpoint(params.0.breakpoint_id)
            .await
            .map_err(to_mcp_error)?;
        structured(&removed)
    }

    #[tool(description = "Flip a breakpoint between enabled and disabled")]
    async fn debugger_toggle_breakpoint(
        &self,
        params: Parameters<DebuggerBreakpointIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let breakpoint = self
            .orchestrator
            .toggle_breakpoint(params.0.breakpoint_id)
            .await
            .map_err(to_mcp_error)?;
        structured(&breakpoint)
    }

    #[tool(description = "Enable or disable a breakpoint")]
    async fn debugger_set_breakpoint_enabled(
        &self,
        params: Parameters<DebuggerBreakpointEnabledParams>,
    ) -> Result<CallToolResult, McpError> {
        let breakpoint = self
            .orchestrator
            .set_breakpoint_enabled(params.0.breakpoint_id, params.0.enabled)
            .await
            .map_err(to_mcp_error)?;
        structured(&breakpoint)
    }

    #[tool(description = "Remove every breakpoint in a source file")]
    async fn debugger_clear_breakpoints(
        &self,
        params: Parameters<DebuggerSourceParams>,
    ) -> Result<CallToolResult, McpError> {
        let path = params
            .0
            .source_path
            .ok_or_else(|| McpError::invalid_params("source_path is required", None))?;
        let removed = self.orchestrator.clear_breakpoints(Path::new(&path)).await;
        structured(&json!({ "removed": removed }))
    }

    #[tool(description = "List breakpoints, for one file or all of them")]
    async fn debugger_list_breakpoints(
        &self,
        params: Parameters<DebuggerSourceParams>,
    ) -> Result<CallToolResult, McpError> {
        let breakpoints = match params.0.source_path {
            Some(path) => self.orchestrator.breakpoints_for_file(Path::new(&path)).await,
            None => self.orchestrator.all_breakpoints().await,
        };
        structured(&json!({ "breakpoints": breakpoints }))
    }

    #[tool(description = "List threads of the debuggee")]
    async fn debugger_threads(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        let threads = self.orchestrator.get_threads(id).await.map_err(to_mcp_error)?;
        structured(&json!({ "threads": threads }))
    }

    #[tool(description = "Read the call stack of a thread")]
    async fn debugger_stack_trace(
        &self,
        params: Parameters<DebuggerStackTraceParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        let frames = self
            .orchestrator
            .get_stack_trace(params.0.thread_id, id)
            .await
            .map_err(to_mcp_error)?;
        structured(&json!({ "stack_frames": frames }))
    }

    #[tool(description = "Read the variable scopes of a stack frame")]
    async fn debugger_scopes(
        &self,
        params: Parameters<DebuggerFrameParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        let scopes = self
            .orchestrator
            .get_scopes(params.0.frame_id, id)
            .await
            .map_err(to_mcp_error)?;
        structured(&json!({ "scopes": scopes }))
    }

    #[tool(description = "Read variables from a variables reference")]
    async fn debugger_variables(
        &self,
        params: Parameters<DebuggerVariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_session_id(params.0.session_id.as_deref())?;
        let variables = self
            .orchestrator
            .get_variables(params.0.variables_reference, id)
            .await
            .map_err(to_mcp_error)?;
        structured(&json!({ "variables": variables }))
    }

    #[tool(description = "Assign a new value to a variable")]
    async fn debugger_set_variable(
        &self,
        params: Parameters<DebuggerSetVariableParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let id = parse_session_id(params.session_id.as_deref())?;
        let updated = self
            .orchestrator
            .set_variable(params.variables_reference, &params.name, &params.value, id)
            .await
            .map_err(to_mcp_error)?;
        structured(&updated)
    }

    #[tool(description = "Evaluate expression in debugger context")]
    async fn debugger_evaluate(
        &self,
        params: Parameters<DebuggerEvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let id = parse_session_id(params.session_id.as_deref())?;
        let result = self
            .orchestrator
            .evaluate(&params.expression, params.frame_id, params.context.as_deref(), id)
            .await
            .map_err(to_mcp_error)?;
        structured(&result)
    }

    #[tool(description = "Add a watch expression")]
    async fn debugger_add_watch(
        &self,
        params: Parameters<DebuggerWatchParams>,
    ) -> Result<CallToolResult, McpError> {
        let watch = self
            .orchestrator
            .add_watch(&params.0.expression)
            .await
            .map_err(to_mcp_error)?;
        structured(&watch)
    }

    #[tool(description = "Remove a watch expression")]
    async fn debugger_remove_watch(
        &self,
        params: Parameters<DebuggerWatchIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let watch = self
            .orchestrator
            .remove_watch(params.0.watch_id)
            .await
            .map_err(to_mcp_error)?;
        structured(&watch)
    }

    #[tool(description = "Re-evaluate one watch expression")]
    async fn debugger_refresh_watch(
        &self,
        params: Parameters<DebuggerWatchIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let watch = self
            .orchestrator
            .refresh_watch(params.0.watch_id)
            .await
            .map_err(to_mcp_error)?;
        structured(&watch)
    }

    #[tool(description = "Re-evaluate all watch expressions and return them")]
    async fn debugger_watches(
        &self,
        _params: Parameters<EmptyParams>,
    ) -> Result<CallToolResult, McpError> {
        let watches = self.orchestrator.refresh_watches().await;
        structured(&json!({ "watches": watches }))
    }

    #[tool(description = "Execute debugger console command")]
    async fn debugger_console(
        &self,
        params: Parameters<DebuggerConsoleParams>,
    ) -> Result<CallToolResult, McpError> {
        let output = self
            .orchestrator
            .execute_in_console(&params.0.command)
            .await
            .map_err(to_mcp_error)?;
        structured(&json!({ "output": output }))
    }

    #[tool(description = "Read the debug console history, optionally clearing it")]
    async fn debugger_console_history(
        &self,
        params: Parameters<DebuggerConsoleHistoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let messages = self.orchestrator.console_messages().await;
        if params.0.clear {
            self.orchestrator.clear_console().await;
        }
        structured(&json!({ "messages": messages }))
    }
}

#[tool_handler]
impl ServerHandler for DebuggerMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Debugger MCP Server: multi-session debug adapter orchestration with breakpoints, watches and console"
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let orchestrator = Arc::new(SessionOrchestrator::new(DapConfig::from_env()));
    match AuditLogger::new(&audit_dir()).await {
        Ok(audit) => spawn_audit_pump(Arc::new(audit), orchestrator.subscribe()),
        Err(e) => tracing::warn!("audit log disabled: {e}"),
    }

    let server = DebuggerMcpServer::new(orchestrator.clone());
    let transport = transport::stdio();

    tracing::info!("Starting Debugger MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;
    orchestrator.shutdown().await;

    Ok(())
}
