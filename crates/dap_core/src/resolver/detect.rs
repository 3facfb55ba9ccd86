use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::registry::{AdapterKind, AdapterRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedDebugger {
    pub kind: AdapterKind,
    pub display_name: &'static str,
    pub confidence: Confidence,
    /// File name or extension that triggered the suggestion.
    pub reason: String,
}

/// Manifest and build files that identify a project's toolchain.
const MARKERS: &[(&str, &[AdapterKind])] = &[
    (
        "Cargo.toml",
        &[AdapterKind::CodeLldb, AdapterKind::LldbDap, AdapterKind::Gdb],
    ),
    ("pyproject.toml", &[AdapterKind::Debugpy]),
    ("setup.py", &[AdapterKind::Debugpy]),
    ("requirements.txt", &[AdapterKind::Debugpy]),
    ("Pipfile", &[AdapterKind::Debugpy]),
    ("package.json", &[AdapterKind::JsDebug]),
    ("tsconfig.json", &[AdapterKind::JsDebug]),
    ("go.mod", &[AdapterKind::Delve]),
    (
        "CMakeLists.txt",
        &[AdapterKind::LldbDap, AdapterKind::Gdb, AdapterKind::CodeLldb],
    ),
    ("Makefile", &[AdapterKind::LldbDap, AdapterKind::Gdb, AdapterKind::CodeLldb]),
    ("meson.build", &[AdapterKind::LldbDap, AdapterKind::Gdb, AdapterKind::CodeLldb]),
];

/// Guesses relevant adapter kinds from the top level of `root`. An
/// unreadable directory yields no suggestions.
pub async fn detect(root: &Path) -> Vec<DetectedDebugger> {
    let mut names = Vec::new();
    match tokio::fs::read_dir(root).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Err(e) => {
            debug!(root = %root.display(), "workspace not readable: {e}");
            return Vec::new();
        }
    }
    detect_from_names(&names)
}

pub(crate) fn detect_from_names(names: &[String]) -> Vec<DetectedDebugger> {
    let mut found: BTreeMap<AdapterKind, DetectedDebugger> = BTreeMap::new();

    for (marker, kinds) in MARKERS {
        if !names.iter().any(|n| n == marker) {
            continue;
        }
        for kind in kinds.iter().copied() {
            found.entry(kind).or_insert_with(|| DetectedDebugger {
                kind,
                display_name: AdapterRegistry::get(kind).display_name,
                confidence: Confidence::High,
                reason: (*marker).to_string(),
            });
        }
    }

    for name in names {
        let Some(extension) = Path::new(name).extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let Some(language) = AdapterRegistry::language_for_extension(extension) else {
            continue;
        };
        for definition in AdapterRegistry::by_language(language) {
            found
                .entry(definition.kind)
                .or_insert_with(|| DetectedDebugger {
                    kind: definition.kind,
                    display_name: definition.display_name,
                    confidence: Confidence::Medium,
                    reason: format!(".{extension}"),
                });
        }
    }

    let mut detected: Vec<DetectedDebugger> = found.into_values().collect();
    detected.sort_by(|a, b| b.confidence.cmp(&a.confidence).then(a.kind.cmp(&b.kind)));
    detected
}
