//! Static catalogue of the debug adapters this crate knows how to find.
//!
//! Everything here is plain data: discovery order, argument templates and
//! launch templates. Resolution against the host lives in [`crate::resolver`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AdapterKind {
    #[serde(rename = "debugpy")]
    Debugpy,
    #[serde(rename = "codelldb")]
    CodeLldb,
    #[serde(rename = "lldb-dap")]
    LldbDap,
    #[serde(rename = "gdb")]
    Gdb,
    #[serde(rename = "js-debug")]
    JsDebug,
    #[serde(rename = "delve")]
    Delve,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 6] = [
        AdapterKind::Debugpy,
        AdapterKind::CodeLldb,
        AdapterKind::LldbDap,
        AdapterKind::Gdb,
        AdapterKind::JsDebug,
        AdapterKind::Delve,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Debugpy => "debugpy",
            Self::CodeLldb => "codelldb",
            Self::LldbDap => "lldb-dap",
            Self::Gdb => "gdb",
            Self::JsDebug => "js-debug",
            Self::Delve => "delve",
        }
    }

    /// Arguments that put a binary found on PATH (or in an extension
    /// directory) into debug-adapter mode. `{port}` is substituted when the
    /// transport is opened.
    pub fn adapter_args(self) -> &'static [&'static str] {
        match self {
            Self::Debugpy => &[],
            Self::CodeLldb => &[],
            Self::LldbDap => &[],
            Self::Gdb => &["--interpreter=dap"],
            Self::JsDebug => &["{port}", "127.0.0.1"],
            Self::Delve => &["dap", "--listen=127.0.0.1:{port}"],
        }
    }

    /// Arguments used after an interpreter that successfully imported the
    /// kind's module.
    pub fn module_args(self) -> &'static [&'static str] {
        match self {
            Self::Debugpy => &["-m", "debugpy.adapter"],
            _ => &[],
        }
    }

    pub fn transport(self) -> TransportMode {
        match self {
            Self::JsDebug | Self::Delve => TransportMode::Socket,
            _ => TransportMode::Stdio,
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == s)
            .ok_or_else(|| format!("unknown adapter kind '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stdio,
    Socket,
}

/// Script interpreters that discovery can wrap an entry point with or probe
/// for an importable module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpreter {
    Python,
    Node,
}

impl Interpreter {
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["python3", "python", "py"],
            Self::Node => &["node"],
        }
    }

    /// Arguments that exit zero only when `module` can be loaded.
    pub fn import_probe_args(self, module: &str) -> Vec<String> {
        match self {
            Self::Python => vec!["-c".into(), format!("import {module}")],
            Self::Node => vec!["-e".into(), format!("require.resolve('{module}')")],
        }
    }

    pub fn for_script(path: &std::path::Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("js" | "mjs" | "cjs") => Some(Self::Node),
            Some("py") => Some(Self::Python),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageManager {
    Npm,
}

impl PackageManager {
    pub fn command(self) -> &'static str {
        match self {
            Self::Npm => "npm",
        }
    }

    pub fn prefix_args(self) -> &'static [&'static str] {
        match self {
            Self::Npm => &["prefix", "-g"],
        }
    }

    pub fn interpreter(self) -> Interpreter {
        match self {
            Self::Npm => Interpreter::Node,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    /// Look for `<prefix><version>` under the editor extension roots and run
    /// `binary` relative to the newest match.
    ExtensionDirectory {
        prefix: &'static str,
        binary: &'static str,
        interpreter: Option<Interpreter>,
    },
    SystemPath { command: &'static str },
    InterpreterModule {
        module: &'static str,
        interpreter: Interpreter,
    },
    GlobalPackage {
        manager: PackageManager,
        package: &'static str,
        command: &'static str,
    },
}

impl DiscoveryStrategy {
    pub fn label(&self) -> String {
        match self {
            Self::ExtensionDirectory { prefix, .. } => format!("extension:{prefix}"),
            Self::SystemPath { command } => format!("path:{command}"),
            Self::InterpreterModule { module, .. } => format!("module:{module}"),
            Self::GlobalPackage {
                manager, package, ..
            } => format!("{}:{package}", manager.command()),
        }
    }
}

#[derive(Debug)]
pub struct AdapterDefinition {
    pub kind: AdapterKind,
    pub display_name: &'static str,
    pub languages: &'static [&'static str],
    pub strategies: &'static [DiscoveryStrategy],
    launch_template: fn() -> Value,
}

impl AdapterDefinition {
    pub fn launch_template(&self) -> Value {
        (self.launch_template)()
    }

    pub fn serves(&self, language: &str) -> bool {
        self.languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }
}

static DEFINITIONS: [AdapterDefinition; 6] = [
    AdapterDefinition {
        kind: AdapterKind::Debugpy,
        display_name: "Python (debugpy)",
        languages: &["python"],
        strategies: &[
            DiscoveryStrategy::ExtensionDirectory {
                prefix: "ms-python.debugpy-",
                binary: "bundled/libs/debugpy/adapter",
                interpreter: Some(Interpreter::Python),
            },
            DiscoveryStrategy::InterpreterModule {
                module: "debugpy",
                interpreter: Interpreter::Python,
            },
        ],
        launch_template: || {
            json!({
                "type": "debugpy",
                "console": "internalConsole",
                "justMyCode": true,
                "redirectOutput": true,
            })
        },
    },
    AdapterDefinition {
        kind: AdapterKind::CodeLldb,
        display_name: "CodeLLDB",
        languages: &["rust", "c", "cpp"],
        strategies: &[
            DiscoveryStrategy::ExtensionDirectory {
                prefix: "vadimcn.vscode-lldb-",
                binary: "adapter/codelldb",
                interpreter: None,
            },
            DiscoveryStrategy::SystemPath {
                command: "codelldb",
            },
        ],
        launch_template: || {
            json!({
                "type": "lldb",
                "sourceLanguages": ["rust"],
                "terminal": "console",
            })
        },
    },
    AdapterDefinition {
        kind: AdapterKind::LldbDap,
        display_name: "LLDB DAP",
        languages: &["c", "cpp", "rust", "swift"],
        strategies: &[
            DiscoveryStrategy::SystemPath { command: "lldb-dap" },
            DiscoveryStrategy::SystemPath {
                command: "lldb-vscode",
            },
        ],
        launch_template: || {
            json!({
                "type": "lldb-dap",
                "stopOnEntry": false,
            })
        },
    },
    AdapterDefinition {
        kind: AdapterKind::Gdb,
        display_name: "GDB",
        languages: &["c", "cpp", "rust"],
        strategies: &[DiscoveryStrategy::SystemPath { command: "gdb" }],
        launch_template: || {
            json!({
                "type": "gdb",
                "stopAtBeginningOfMainSubprogram": false,
            })
        },
    },
    AdapterDefinition {
        kind: AdapterKind::JsDebug,
        display_name: "JavaScript Debugger",
        languages: &["javascript", "typescript"],
        strategies: &[
            DiscoveryStrategy::ExtensionDirectory {
                prefix: "ms-vscode.js-debug-",
                binary: "src/dapDebugServer.js",
                interpreter: Some(Interpreter::Node),
            },
            DiscoveryStrategy::GlobalPackage {
                manager: PackageManager::Npm,
                package: "js-debug",
                command: "js-debug",
            },
        ],
        launch_template: || {
            json!({
                "type": "pwa-node",
                "console": "internalConsole",
                "sourceMaps": true,
            })
        },
    },
    AdapterDefinition {
        kind: AdapterKind::Delve,
        display_name: "Delve",
        languages: &["go"],
        strategies: &[DiscoveryStrategy::SystemPath { command: "dlv" }],
        launch_template: || {
            json!({
                "type": "go",
                "mode": "debug",
            })
        },
    },
];

pub struct AdapterRegistry;

impl AdapterRegistry {
    pub fn all() -> &'static [AdapterDefinition] {
        &DEFINITIONS
    }

    pub fn get(kind: AdapterKind) -> &'static AdapterDefinition {
        // DEFINITIONS is declared in AdapterKind::ALL order
        &DEFINITIONS[kind as usize]
    }

    /// Every definition serving `language`, in catalogue order.
    pub fn by_language(language: &str) -> Vec<&'static AdapterDefinition> {
        DEFINITIONS.iter().filter(|d| d.serves(language)).collect()
    }

    pub fn language_for_extension(extension: &str) -> Option<&'static str> {
        let language = match extension.to_ascii_lowercase().as_str() {
            "py" | "pyw" => "python",
            "rs" => "rust",
            "c" | "h" => "c",
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
            "js" | "mjs" | "cjs" | "jsx" => "javascript",
            "ts" | "tsx" | "mts" => "typescript",
            "go" => "go",
            "swift" => "swift",
            _ => return None,
        };
        Some(language)
    }
}
