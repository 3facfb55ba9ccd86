use std::path::{Path, PathBuf};

/// Host flavour that decides where discovery looks and how commands are
/// spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Unix-like machine with a local editor install.
    Desktop,
    /// Unix-like machine reached over SSH, editor extensions live in the
    /// remote-server directories.
    Server,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            return Self::Windows;
        }
        let remote = std::env::var_os("SSH_CONNECTION").is_some()
            || std::env::var_os("VSCODE_AGENT_FOLDER").is_some();
        let headless = cfg!(target_os = "linux")
            && std::env::var_os("DISPLAY").is_none()
            && std::env::var_os("WAYLAND_DISPLAY").is_none();
        if remote || headless {
            Self::Server
        } else {
            Self::Desktop
        }
    }

    pub fn extension_roots(self, home: &Path) -> Vec<PathBuf> {
        let editors: &[&str] = match self {
            Self::Desktop => &[".vscode", ".vscode-oss", ".cursor"],
            Self::Server => &[".vscode-server", ".vscode-server-insiders", ".openvscode-server"],
            Self::Windows => &[".vscode", ".cursor"],
        };
        editors
            .iter()
            .map(|editor| home.join(editor).join("extensions"))
            .collect()
    }

    /// Platform spelling of a bare executable name.
    pub fn executable_name(self, command: &str) -> String {
        match self {
            Self::Windows if Path::new(command).extension().is_none() => format!("{command}.exe"),
            _ => command.to_string(),
        }
    }

    /// Spelling of a script shim installed by a package manager.
    pub fn shim_name(self, command: &str) -> String {
        match self {
            Self::Windows => format!("{command}.cmd"),
            _ => command.to_string(),
        }
    }

    /// Interpreter names worth trying, in order.
    pub fn interpreter_candidates(self, candidates: &[&'static str]) -> Vec<&'static str> {
        candidates
            .iter()
            .copied()
            .filter(|name| match self {
                // `python3` on Windows is usually the store redirect stub
                Self::Windows => *name != "python3",
                _ => *name != "py",
            })
            .collect()
    }

    pub fn global_bin_dir(self, prefix: &Path) -> PathBuf {
        match self {
            Self::Windows => prefix.to_path_buf(),
            _ => prefix.join("bin"),
        }
    }

    pub fn global_module_dir(self, prefix: &Path) -> PathBuf {
        match self {
            Self::Windows => prefix.join("node_modules"),
            _ => prefix.join("lib").join("node_modules"),
        }
    }
}
