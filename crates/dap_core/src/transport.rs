//! Byte channels to a debug adapter. Nothing above this module knows which
//! implementation is in use.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{DapConfig, DebugConfig};
use crate::error::DapError;
use crate::resolver::{AdapterTarget, ResolvedAdapter};
use crate::Result;

pub type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

const PORT_PLACEHOLDER: &str = "{port}";
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Transport: Send {
    /// Hands out the read and write sides. Returns `None` once taken.
    fn take_io(&mut self) -> Option<(ReadHalf, WriteHalf)>;

    /// Releases the channel and anything backing it. Idempotent.
    async fn close(&mut self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Any duplex stream a remote connection can hand us.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Remote-connection collaborator that carries adapter traffic.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn open_tunnel(
        &self,
        adapter: &ResolvedAdapter,
        config: &DebugConfig,
    ) -> Result<Box<dyn TunnelStream>>;
}

/// Adapter process speaking the protocol on stdin/stdout.
pub struct ProcessTransport {
    child: Child,
    io: Option<(ReadHalf, WriteHalf)>,
    program: PathBuf,
    closed: bool,
}

impl ProcessTransport {
    pub fn spawn(program: &Path, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            DapError::Transport(format!(
                "Failed to spawn debug adapter '{}': {e}",
                program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DapError::Transport("missing stdin pipe for adapter".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DapError::Transport("missing stdout pipe for adapter".into()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, program.to_path_buf());
        }

        info!(program = %program.display(), pid = ?child.id(), "spawned debug adapter");
        Ok(Self {
            child,
            io: Some((Box::new(stdout), Box::new(stdin))),
            program: program.to_path_buf(),
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn take_io(&mut self) -> Option<(ReadHalf, WriteHalf)> {
        self.io.take()
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io = None;
        terminate_child(&mut self.child, &self.program).await;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("process {}", self.program.display())
    }
}

/// TCP connection to an adapter, optionally owning the adapter process
/// that listens on the port.
pub struct SocketTransport {
    io: Option<(ReadHalf, WriteHalf)>,
    address: String,
    child: Option<(Child, PathBuf)>,
    closed: bool,
}

impl SocketTransport {
    /// Connects to an adapter that is already listening.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let address = format!("{host}:{port}");
        let stream = connect_with_retry(&address, connect_timeout, None).await?;
        Ok(Self::from_stream(stream, address, None))
    }

    /// Spawns an adapter on a free loopback port and connects to it.
    pub async fn spawn_and_connect(
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let port = free_port().await?;
        let args = substitute_port(args, port);

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let mut child = command.spawn().map_err(|e| {
            DapError::Transport(format!(
                "Failed to spawn debug adapter '{}': {e}",
                program.display()
            ))
        })?;
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, program.to_path_buf());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, program.to_path_buf());
        }
        info!(program = %program.display(), port, "spawned socket debug adapter");

        let address = format!("127.0.0.1:{port}");
        match connect_with_retry(&address, connect_timeout, Some(&mut child)).await {
            Ok(stream) => Ok(Self::from_stream(
                stream,
                address,
                Some((child, program.to_path_buf())),
            )),
            Err(e) => {
                terminate_child(&mut child, program).await;
                Err(e)
            }
        }
    }

    fn from_stream(stream: TcpStream, address: String, child: Option<(Child, PathBuf)>) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self {
            io: Some((Box::new(read), Box::new(write))),
            address,
            child,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn take_io(&mut self) -> Option<(ReadHalf, WriteHalf)> {
        self.io.take()
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io = None;
        if let Some((child, program)) = self.child.as_mut() {
            terminate_child(child, program).await;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("socket {}", self.address)
    }
}

/// Adapter traffic carried over a channel owned by the remote-connection
/// manager. Closing drops our end only.
pub struct TunnelTransport {
    stream: Option<Box<dyn TunnelStream>>,
    label: String,
}

impl TunnelTransport {
    pub fn new(stream: Box<dyn TunnelStream>, label: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            label: label.into(),
        }
    }
}

#[async_trait]
impl Transport for TunnelTransport {
    fn take_io(&mut self) -> Option<(ReadHalf, WriteHalf)> {
        let stream = self.stream.take()?;
        let (read, write) = tokio::io::split(stream);
        Some((Box::new(read), Box::new(write)))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tunnel {}", self.label)
    }
}

/// Opens the channel a session talks over. Spawned adapters inherit this
/// process's environment; debuggee variables go in the launch arguments.
pub async fn create_transport(
    adapter: &ResolvedAdapter,
    config: &DebugConfig,
    connector: Option<&dyn RemoteConnector>,
    settings: &DapConfig,
) -> Result<Box<dyn Transport>> {
    if config.remote {
        let connector = connector.ok_or_else(|| {
            DapError::Unsupported("remote debugging without a remote connection".into())
        })?;
        let stream = connector.open_tunnel(adapter, config).await?;
        debug!(kind = %adapter.kind, "opened tunnel transport");
        return Ok(Box::new(TunnelTransport::new(
            stream,
            adapter.kind.to_string(),
        )));
    }

    let cwd = config.cwd.as_deref();
    let transport: Box<dyn Transport> = match &adapter.target {
        AdapterTarget::Stdio { program, args } => {
            Box::new(ProcessTransport::spawn(program, args, cwd)?)
        }
        AdapterTarget::SpawnedSocket { program, args } => Box::new(
            SocketTransport::spawn_and_connect(program, args, cwd, settings.connect_timeout)
                .await?,
        ),
        AdapterTarget::Server { host, port } => {
            Box::new(SocketTransport::connect(host, *port, settings.connect_timeout).await?)
        }
    };
    Ok(transport)
}

pub(crate) fn substitute_port(args: &[String], port: u16) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
        .collect()
}

async fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| DapError::Transport(format!("Failed to reserve a local port: {e}")))?;
    Ok(listener.local_addr()?.port())
}

async fn connect_with_retry(
    address: &str,
    connect_timeout: Duration,
    mut child: Option<&mut Child>,
) -> Result<TcpStream> {
    let deadline = Instant::now() + connect_timeout;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                debug!(address, "connected to debug adapter");
                return Ok(stream);
            }
            Err(e) => {
                if let Some(child) = child.as_deref_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(DapError::Transport(format!(
                            "Debug adapter exited with {status} before accepting connections"
                        )));
                    }
                }
                if Instant::now() >= deadline {
                    return Err(DapError::Transport(format!(
                        "Failed to connect to debug adapter at {address}: {e}"
                    )));
                }
            }
        }
        sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

async fn terminate_child(child: &mut Child, program: &Path) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(program = %program.display(), %status, "adapter already exited");
        return;
    }
    if let Err(e) = child.start_kill() {
        warn!(program = %program.display(), "failed to kill adapter: {e}");
        return;
    }
    match timeout(KILL_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!(program = %program.display(), %status, "adapter stopped"),
        Ok(Err(e)) => warn!(program = %program.display(), "failed to reap adapter: {e}"),
        Err(_) => warn!(program = %program.display(), "adapter did not exit after kill"),
    }
}

/// Drains an adapter's side output into the log so the pipe never fills.
fn forward_lines<R>(stream: R, program: PathBuf)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(adapter = %program.display(), "{line}");
        }
    });
}
