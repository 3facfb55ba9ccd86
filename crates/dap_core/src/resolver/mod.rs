//! Turns registry entries into runnable adapters.

mod detect;
mod platform;
mod probe;
mod strategies;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::registry::{AdapterKind, AdapterRegistry, TransportMode};

pub use detect::{detect, Confidence, DetectedDebugger};
pub use platform::Platform;
pub use probe::{HostProbe, SystemProbe};

/// How to reach a resolved adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdapterTarget {
    /// Spawn and talk over stdin/stdout.
    Stdio { program: PathBuf, args: Vec<String> },
    /// Spawn with a free port substituted for `{port}`, then connect.
    SpawnedSocket { program: PathBuf, args: Vec<String> },
    /// An adapter server that is already listening.
    Server { host: String, port: u16 },
}

impl AdapterTarget {
    pub fn transport_mode(&self) -> TransportMode {
        match self {
            Self::Stdio { .. } => TransportMode::Stdio,
            Self::SpawnedSocket { .. } | Self::Server { .. } => TransportMode::Socket,
        }
    }

    pub fn program(&self) -> Option<&Path> {
        match self {
            Self::Stdio { program, .. } | Self::SpawnedSocket { program, .. } => Some(program),
            Self::Server { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAdapter {
    pub kind: AdapterKind,
    pub target: AdapterTarget,
    /// Label of the discovery strategy (or override) that produced this.
    pub strategy: String,
}

impl ResolvedAdapter {
    /// Adapter binary chosen explicitly by the user.
    pub fn from_path(kind: AdapterKind, program: PathBuf) -> Self {
        let args = kind.adapter_args().iter().map(|a| a.to_string()).collect();
        let target = match kind.transport() {
            TransportMode::Stdio => AdapterTarget::Stdio { program, args },
            TransportMode::Socket => AdapterTarget::SpawnedSocket { program, args },
        };
        Self {
            kind,
            target,
            strategy: "override".to_string(),
        }
    }

    pub fn server(kind: AdapterKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            target: AdapterTarget::Server {
                host: host.into(),
                port,
            },
            strategy: "debug-server".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterInfo {
    pub kind: AdapterKind,
    pub display_name: &'static str,
    pub languages: &'static [&'static str],
    pub installed: bool,
    pub resolved: Option<ResolvedAdapter>,
}

/// Resolves adapter kinds against the host, caching successes per kind.
pub struct AdapterResolver {
    probe: Arc<dyn SystemProbe>,
    platform: Platform,
    cache: RwLock<HashMap<AdapterKind, Arc<ResolvedAdapter>>>,
    availability: RwLock<HashMap<AdapterKind, bool>>,
}

impl AdapterResolver {
    pub fn new(probe: Arc<dyn SystemProbe>, platform: Platform) -> Self {
        Self {
            probe,
            platform,
            cache: RwLock::new(HashMap::new()),
            availability: RwLock::new(HashMap::new()),
        }
    }

    pub fn for_host(probe_timeout: std::time::Duration) -> Self {
        Self::new(Arc::new(HostProbe::new(probe_timeout)), Platform::current())
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Returns the cached adapter for `kind`, or tries each discovery
    /// strategy in registry order. Failures are not cached.
    pub async fn resolve(&self, kind: AdapterKind) -> Option<Arc<ResolvedAdapter>> {
        if let Some(cached) = self.cache.read().await.get(&kind) {
            return Some(cached.clone());
        }

        let definition = AdapterRegistry::get(kind);
        for strategy in definition.strategies {
            let Some(target) =
                strategies::run(self.probe.as_ref(), self.platform, kind, strategy).await
            else {
                continue;
            };

            let resolved = Arc::new(ResolvedAdapter {
                kind,
                target,
                strategy: strategy.label(),
            });
            info!(%kind, strategy = %resolved.strategy, "resolved debug adapter");

            // concurrent resolvers compute the same value; last writer wins
            self.cache.write().await.insert(kind, resolved.clone());
            self.availability.write().await.insert(kind, true);
            return Some(resolved);
        }

        debug!(%kind, "no discovery strategy produced an adapter");
        self.availability.write().await.insert(kind, false);
        None
    }

    /// Resolves every registry kind and reports whether it is installed.
    pub async fn list_available(&self) -> Vec<AdapterInfo> {
        let mut infos = Vec::with_capacity(AdapterKind::ALL.len());
        for definition in AdapterRegistry::all() {
            let resolved = self.resolve(definition.kind).await;
            infos.push(AdapterInfo {
                kind: definition.kind,
                display_name: definition.display_name,
                languages: definition.languages,
                installed: resolved.is_some(),
                resolved: resolved.map(|r| (*r).clone()),
            });
        }
        infos
    }

    /// Last known availability without probing.
    pub async fn is_available(&self, kind: AdapterKind) -> Option<bool> {
        self.availability.read().await.get(&kind).copied()
    }

    pub async fn detect(&self, workspace_root: &Path) -> Vec<DetectedDebugger> {
        detect(workspace_root).await
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        self.availability.write().await.clear();
        debug!("adapter resolution cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted host: PATH entries, runnable commands and a fake filesystem.
    #[derive(Default)]
    struct FakeProbe {
        home: Option<PathBuf>,
        path: Mutex<HashMap<String, PathBuf>>,
        runs: HashMap<(PathBuf, Vec<String>), String>,
        dirs: HashMap<PathBuf, Vec<String>>,
        files: HashMap<PathBuf, String>,
        executables: HashSet<PathBuf>,
        which_calls: AtomicUsize,
    }

    impl FakeProbe {
        fn on_path(self, command: &str, location: &str) -> Self {
            self.path
                .lock()
                .unwrap()
                .insert(command.to_string(), PathBuf::from(location));
            self
        }

        fn runs(mut self, program: &str, args: &[&str], stdout: &str) -> Self {
            self.runs.insert(
                (
                    PathBuf::from(program),
                    args.iter().map(|a| a.to_string()).collect(),
                ),
                stdout.to_string(),
            );
            self
        }

        fn dir(mut self, dir: &str, entries: &[&str]) -> Self {
            self.dirs.insert(
                PathBuf::from(dir),
                entries.iter().map(|e| e.to_string()).collect(),
            );
            self
        }

        fn file(mut self, path: &str, contents: &str) -> Self {
            self.files.insert(PathBuf::from(path), contents.to_string());
            self
        }

        fn executable(mut self, path: &str) -> Self {
            self.executables.insert(PathBuf::from(path));
            self
        }
    }

    #[async_trait]
    impl SystemProbe for FakeProbe {
        fn home_dir(&self) -> Option<PathBuf> {
            self.home.clone()
        }

        fn which(&self, command: &str) -> Option<PathBuf> {
            self.which_calls.fetch_add(1, Ordering::SeqCst);
            self.path.lock().unwrap().get(command).cloned()
        }

        async fn run(&self, program: &Path, args: &[String]) -> Option<String> {
            self.runs
                .get(&(program.to_path_buf(), args.to_vec()))
                .cloned()
        }

        async fn list_dir(&self, dir: &Path) -> Vec<String> {
            self.dirs.get(dir).cloned().unwrap_or_default()
        }

        async fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path) || self.executables.contains(path)
        }

        async fn is_executable(&self, path: &Path) -> bool {
            self.executables.contains(path)
        }

        async fn read_to_string(&self, path: &Path) -> Option<String> {
            self.files.get(path).cloned()
        }
    }

    fn resolver(probe: FakeProbe) -> AdapterResolver {
        AdapterResolver::new(Arc::new(probe), Platform::Desktop)
    }

    #[tokio::test]
    async fn resolve_twice_returns_the_cached_value() {
        let resolver = resolver(FakeProbe::default().on_path("gdb", "/usr/bin/gdb"));

        let first = resolver.resolve(AdapterKind::Gdb).await.expect("gdb resolves");
        let second = resolver.resolve(AdapterKind::Gdb).await.expect("gdb resolves");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            first.target,
            AdapterTarget::Stdio {
                program: PathBuf::from("/usr/bin/gdb"),
                args: vec!["--interpreter=dap".to_string()],
            }
        );
        assert_eq!(first.strategy, "path:gdb");
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let probe = Arc::new(FakeProbe::default());
        let resolver = AdapterResolver::new(probe.clone(), Platform::Desktop);

        assert!(resolver.resolve(AdapterKind::LldbDap).await.is_none());
        assert_eq!(resolver.is_available(AdapterKind::LldbDap).await, Some(false));

        probe
            .path
            .lock()
            .unwrap()
            .insert("lldb-dap".to_string(), PathBuf::from("/opt/llvm/bin/lldb-dap"));

        let resolved = resolver
            .resolve(AdapterKind::LldbDap)
            .await
            .expect("resolves once installed");
        assert_eq!(
            resolved.target.program(),
            Some(Path::new("/opt/llvm/bin/lldb-dap"))
        );
        assert_eq!(resolver.is_available(AdapterKind::LldbDap).await, Some(true));
    }

    #[tokio::test]
    async fn failed_strategies_fall_through_in_order() {
        // extension dir missing, python3 lacks debugpy, python has it
        let probe = FakeProbe {
            home: Some(PathBuf::from("/home/dev")),
            ..Default::default()
        }
        .on_path("python3", "/usr/bin/python3")
        .on_path("python", "/opt/py/bin/python")
        .runs("/opt/py/bin/python", &["-c", "import debugpy"], "");

        let resolved = resolver(probe)
            .resolve(AdapterKind::Debugpy)
            .await
            .expect("second interpreter imports debugpy");

        assert_eq!(resolved.strategy, "module:debugpy");
        assert_eq!(
            resolved.target,
            AdapterTarget::Stdio {
                program: PathBuf::from("/opt/py/bin/python"),
                args: vec!["-m".to_string(), "debugpy.adapter".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn extension_scan_picks_latest_version_and_wraps_interpreter() {
        let root = "/home/dev/.vscode/extensions";
        let probe = FakeProbe {
            home: Some(PathBuf::from("/home/dev")),
            ..Default::default()
        }
        .dir(
            root,
            &[
                "ms-python.debugpy-2024.0.0",
                "ms-python.debugpy-2025.4.1",
                "rust-lang.rust-analyzer-0.3.0",
            ],
        )
        .file(
            "/home/dev/.vscode/extensions/ms-python.debugpy-2025.4.1/bundled/libs/debugpy/adapter",
            "",
        )
        .on_path("python3", "/usr/bin/python3");

        let resolved = resolver(probe)
            .resolve(AdapterKind::Debugpy)
            .await
            .expect("extension install resolves");

        assert_eq!(resolved.strategy, "extension:ms-python.debugpy-");
        assert_eq!(
            resolved.target,
            AdapterTarget::Stdio {
                program: PathBuf::from("/usr/bin/python3"),
                args: vec![
                    "/home/dev/.vscode/extensions/ms-python.debugpy-2025.4.1/bundled/libs/debugpy/adapter"
                        .to_string()
                ],
            }
        );
    }

    #[tokio::test]
    async fn extension_binary_must_be_executable() {
        let probe = FakeProbe {
            home: Some(PathBuf::from("/home/dev")),
            ..Default::default()
        }
        .dir("/home/dev/.vscode/extensions", &["vadimcn.vscode-lldb-1.11.0"])
        .file(
            "/home/dev/.vscode/extensions/vadimcn.vscode-lldb-1.11.0/adapter/codelldb",
            "",
        )
        .on_path("codelldb", "/usr/local/bin/codelldb");

        let resolved = resolver(probe)
            .resolve(AdapterKind::CodeLldb)
            .await
            .expect("falls back to PATH");
        assert_eq!(resolved.strategy, "path:codelldb");
    }

    #[tokio::test]
    async fn global_package_uses_shim_when_present() {
        let probe = FakeProbe::default()
            .on_path("npm", "/usr/bin/npm")
            .runs("/usr/bin/npm", &["prefix", "-g"], "/usr/local")
            .executable("/usr/local/bin/js-debug");

        let resolved = resolver(probe)
            .resolve(AdapterKind::JsDebug)
            .await
            .expect("npm shim resolves");

        assert_eq!(
            resolved.target,
            AdapterTarget::SpawnedSocket {
                program: PathBuf::from("/usr/local/bin/js-debug"),
                args: vec!["{port}".to_string(), "127.0.0.1".to_string()],
            }
        );
        assert_eq!(resolved.strategy, "npm:js-debug");
    }

    #[tokio::test]
    async fn global_package_falls_back_to_manifest_entry() {
        let probe = FakeProbe::default()
            .on_path("npm", "/usr/bin/npm")
            .on_path("node", "/usr/bin/node")
            .runs("/usr/bin/npm", &["prefix", "-g"], "/usr/local")
            .file(
                "/usr/local/lib/node_modules/js-debug/package.json",
                r#"{ "name": "js-debug", "main": "src/dapDebugServer.js" }"#,
            )
            .file("/usr/local/lib/node_modules/js-debug/src/dapDebugServer.js", "");

        let resolved = resolver(probe)
            .resolve(AdapterKind::JsDebug)
            .await
            .expect("manifest entry resolves");

        assert_eq!(
            resolved.target,
            AdapterTarget::SpawnedSocket {
                program: PathBuf::from("/usr/bin/node"),
                args: vec![
                    "/usr/local/lib/node_modules/js-debug/src/dapDebugServer.js".to_string(),
                    "{port}".to_string(),
                    "127.0.0.1".to_string(),
                ],
            }
        );
    }

    #[tokio::test]
    async fn missing_package_directory_is_not_found() {
        let probe = FakeProbe::default()
            .on_path("npm", "/usr/bin/npm")
            .runs("/usr/bin/npm", &["prefix", "-g"], "/usr/local");

        assert!(resolver(probe).resolve(AdapterKind::JsDebug).await.is_none());
    }

    #[tokio::test]
    async fn list_available_reports_every_kind_and_clear_cache_drops_it() {
        let probe = Arc::new(FakeProbe::default().on_path("dlv", "/go/bin/dlv"));
        let resolver = AdapterResolver::new(probe.clone(), Platform::Desktop);

        let infos = resolver.list_available().await;
        assert_eq!(infos.len(), AdapterKind::ALL.len());
        let installed: Vec<_> = infos.iter().filter(|i| i.installed).map(|i| i.kind).collect();
        assert_eq!(installed, vec![AdapterKind::Delve]);

        let calls_before = probe.which_calls.load(Ordering::SeqCst);
        resolver.resolve(AdapterKind::Delve).await.expect("cached");
        assert_eq!(probe.which_calls.load(Ordering::SeqCst), calls_before);

        resolver.clear_cache().await;
        assert_eq!(resolver.is_available(AdapterKind::Delve).await, None);
        resolver.resolve(AdapterKind::Delve).await.expect("re-resolves");
        assert!(probe.which_calls.load(Ordering::SeqCst) > calls_before);
    }
}
