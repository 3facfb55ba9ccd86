//! The four discovery strategies. Each returns `None` on any failure so the
//! resolver can move on to the next one.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::platform::Platform;
use super::probe::SystemProbe;
use super::AdapterTarget;
use crate::registry::{AdapterKind, DiscoveryStrategy, Interpreter, PackageManager, TransportMode};

pub(crate) async fn run(
    probe: &dyn SystemProbe,
    platform: Platform,
    kind: AdapterKind,
    strategy: &DiscoveryStrategy,
) -> Option<AdapterTarget> {
    let found = match *strategy {
        DiscoveryStrategy::ExtensionDirectory {
            prefix,
            binary,
            interpreter,
        } => extension_directory(probe, platform, kind, prefix, binary, interpreter).await,
        DiscoveryStrategy::SystemPath { command } => system_path(probe, platform, kind, command),
        DiscoveryStrategy::InterpreterModule {
            module,
            interpreter,
        } => interpreter_module(probe, platform, kind, module, interpreter).await,
        DiscoveryStrategy::GlobalPackage {
            manager,
            package,
            command,
        } => global_package(probe, platform, kind, manager, package, command).await,
    };

    if found.is_none() {
        debug!(%kind, strategy = %strategy.label(), "discovery strategy found nothing");
    }
    found
}

fn command_target(kind: AdapterKind, program: PathBuf, mut args: Vec<String>) -> AdapterTarget {
    args.extend(kind.adapter_args().iter().map(|a| a.to_string()));
    match kind.transport() {
        TransportMode::Stdio => AdapterTarget::Stdio { program, args },
        TransportMode::Socket => AdapterTarget::SpawnedSocket { program, args },
    }
}

/// First interpreter on PATH for `interpreter`, honouring platform naming.
fn find_interpreter(
    probe: &dyn SystemProbe,
    platform: Platform,
    interpreter: Interpreter,
) -> Option<PathBuf> {
    platform
        .interpreter_candidates(interpreter.candidates())
        .into_iter()
        .find_map(|name| probe.which(name))
}

/// Target for a script entry point run through its interpreter.
fn script_target(
    probe: &dyn SystemProbe,
    platform: Platform,
    kind: AdapterKind,
    interpreter: Interpreter,
    entry: &Path,
) -> Option<AdapterTarget> {
    let program = find_interpreter(probe, platform, interpreter)?;
    Some(command_target(
        kind,
        program,
        vec![entry.to_string_lossy().into_owned()],
    ))
}

async fn extension_directory(
    probe: &dyn SystemProbe,
    platform: Platform,
    kind: AdapterKind,
    prefix: &str,
    binary: &str,
    interpreter: Option<Interpreter>,
) -> Option<AdapterTarget> {
    let home = probe.home_dir()?;

    for root in platform.extension_roots(&home) {
        // names embed the version, so the greatest name approximates the newest install
        let Some(latest) = probe
            .list_dir(&root)
            .await
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .max()
        else {
            continue;
        };

        let extension_dir = root.join(latest);
        match interpreter {
            Some(interpreter) => {
                let entry = extension_dir.join(binary);
                if probe.exists(&entry).await {
                    if let Some(target) = script_target(probe, platform, kind, interpreter, &entry)
                    {
                        return Some(target);
                    }
                }
            }
            None => {
                let entry = extension_dir.join(platform.executable_name(binary));
                if probe.is_executable(&entry).await {
                    return Some(command_target(kind, entry, Vec::new()));
                }
            }
        }
    }

    None
}

fn system_path(
    probe: &dyn SystemProbe,
    platform: Platform,
    kind: AdapterKind,
    command: &str,
) -> Option<AdapterTarget> {
    let program = probe
        .which(command)
        .or_else(|| probe.which(&platform.executable_name(command)))?;
    Some(command_target(kind, program, Vec::new()))
}

async fn interpreter_module(
    probe: &dyn SystemProbe,
    platform: Platform,
    kind: AdapterKind,
    module: &str,
    interpreter: Interpreter,
) -> Option<AdapterTarget> {
    let probe_args = interpreter.import_probe_args(module);

    for name in platform.interpreter_candidates(interpreter.candidates()) {
        let Some(program) = probe.which(name) else {
            continue;
        };
        if probe.run(&program, &probe_args).await.is_some() {
            let args = kind.module_args().iter().map(|a| a.to_string()).collect();
            return Some(command_target(kind, program, args));
        }
        debug!(%kind, interpreter = %program.display(), "module '{module}' not importable");
    }

    None
}

async fn global_package(
    probe: &dyn SystemProbe,
    platform: Platform,
    kind: AdapterKind,
    manager: PackageManager,
    package: &str,
    command: &str,
) -> Option<AdapterTarget> {
    let manager_bin = probe.which(manager.command())?;
    let prefix_args: Vec<String> = manager.prefix_args().iter().map(|a| a.to_string()).collect();
    let prefix = PathBuf::from(probe.run(&manager_bin, &prefix_args).await?);

    let shim = platform
        .global_bin_dir(&prefix)
        .join(platform.shim_name(command));
    if probe.is_executable(&shim).await {
        return Some(command_target(kind, shim, Vec::new()));
    }

    let package_dir = platform.global_module_dir(&prefix).join(package);
    let manifest = probe.read_to_string(&package_dir.join("package.json")).await?;
    let manifest: Value = serde_json::from_str(&manifest).ok()?;
    let entry = package_dir.join(manifest_entry(&manifest, command)?);

    if let Some(interpreter) = Interpreter::for_script(&entry) {
        if !probe.exists(&entry).await {
            return None;
        }
        return script_target(probe, platform, kind, interpreter, &entry);
    }
    if probe.is_executable(&entry).await {
        return Some(command_target(kind, entry, Vec::new()));
    }
    // extensionless bin scripts without the exec bit run under the manager's runtime
    if probe.exists(&entry).await {
        return script_target(probe, platform, kind, manager.interpreter(), &entry);
    }
    None
}

/// Entry point declared by a package manifest: the `bin` entry for
/// `command` (or the only/first one), else `main`.
pub(crate) fn manifest_entry(manifest: &Value, command: &str) -> Option<String> {
    match manifest.get("bin") {
        Some(Value::String(path)) => return Some(path.clone()),
        Some(Value::Object(bins)) => {
            let chosen = bins
                .get(command)
                .or_else(|| bins.values().next())
                .and_then(Value::as_str);
            if let Some(path) = chosen {
                return Some(path.to_string());
            }
        }
        _ => {}
    }
    manifest
        .get("main")
        .and_then(Value::as_str)
        .map(str::to_string)
}
