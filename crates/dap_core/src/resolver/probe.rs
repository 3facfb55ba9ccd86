use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

/// Host queries made by discovery. Every method is best-effort: a failure
/// is an empty answer, never an error.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    fn home_dir(&self) -> Option<PathBuf>;

    /// PATH lookup of a bare command name.
    fn which(&self, command: &str) -> Option<PathBuf>;

    /// Runs `program` and returns its trimmed stdout when it exits zero.
    async fn run(&self, program: &Path, args: &[String]) -> Option<String>;

    /// Entry names directly under `dir`.
    async fn list_dir(&self, dir: &Path) -> Vec<String>;

    async fn exists(&self, path: &Path) -> bool;

    async fn is_executable(&self, path: &Path) -> bool;

    async fn read_to_string(&self, path: &Path) -> Option<String>;
}

/// Probe backed by the real filesystem and process table.
#[derive(Debug, Clone)]
pub struct HostProbe {
    timeout: Duration,
}

impl HostProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl SystemProbe for HostProbe {
    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    fn which(&self, command: &str) -> Option<PathBuf> {
        which::which(command).ok()
    }

    async fn run(&self, program: &Path, args: &[String]) -> Option<String> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                trace!(program = %program.display(), "probe spawn failed: {e}");
                return None;
            }
            Err(_) => {
                trace!(program = %program.display(), "probe timed out");
                return None;
            }
        };

        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn list_dir(&self, dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn is_executable(&self, path: &Path) -> bool {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o111 != 0
        }
        #[cfg(not(unix))]
        {
            true
        }
    }

    async fn read_to_string(&self, path: &Path) -> Option<String> {
        tokio::fs::read_to_string(path).await.ok()
    }
}
