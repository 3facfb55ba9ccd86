use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Breakpoint, SourceBreakpoint};

pub type BreakpointId = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    /// Turns the breakpoint into a logpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointInfo {
    pub id: BreakpointId,
    pub path: PathBuf,
    /// Requested line, replaced by the adapter's line once verified.
    pub line: u32,
    pub enabled: bool,
    #[serde(flatten)]
    pub options: BreakpointOptions,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Id the adapter assigned in its last verification result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<i64>,
}

impl BreakpointInfo {
    fn to_source_breakpoint(&self) -> SourceBreakpoint {
        SourceBreakpoint {
            line: self.line,
            condition: self.options.condition.clone(),
            hit_condition: self.options.hit_condition.clone(),
            log_message: self.options.log_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointChange {
    Added,
    Updated,
    Removed,
}

/// Breakpoints bucketed by source file. A bucket exists only while it
/// holds at least one breakpoint.
#[derive(Debug, Default)]
pub struct BreakpointStore {
    next_id: BreakpointId,
    files: BTreeMap<PathBuf, Vec<BreakpointInfo>>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a breakpoint at `path:line`. A second request for the same
    /// line returns the existing breakpoint, re-enabled and carrying the
    /// new options; the flag reports whether a new one was created.
    pub fn add(
        &mut self,
        path: &Path,
        line: u32,
        options: BreakpointOptions,
    ) -> (BreakpointInfo, bool) {
        let bucket = self.files.entry(path.to_path_buf()).or_default();
        if let Some(existing) = bucket.iter_mut().find(|bp| bp.line == line) {
            existing.options = options;
            existing.enabled = true;
            return (existing.clone(), false);
        }

        self.next_id += 1;
        let info = BreakpointInfo {
            id: self.next_id,
            path: path.to_path_buf(),
            line,
            enabled: true,
            options,
            verified: false,
            message: None,
            adapter_id: None,
        };
        bucket.push(info.clone());
        (info, true)
    }

    pub fn get(&self, id: BreakpointId) -> Option<&BreakpointInfo> {
        self.files.values().flatten().find(|bp| bp.id == id)
    }

    fn get_mut(&mut self, id: BreakpointId) -> Option<&mut BreakpointInfo> {
        self.files.values_mut().flatten().find(|bp| bp.id == id)
    }

    pub fn remove(&mut self, id: BreakpointId) -> Option<BreakpointInfo> {
        let path = self.get(id)?.path.clone();
        let bucket = self.files.get_mut(&path)?;
        let index = bucket.iter().position(|bp| bp.id == id)?;
        let removed = bucket.remove(index);
        if bucket.is_empty() {
            self.files.remove(&path);
        }
        Some(removed)
    }

    pub fn toggle(&mut self, id: BreakpointId) -> Option<BreakpointInfo> {
        let enabled = !self.get(id)?.enabled;
        self.set_enabled(id, enabled)
    }

    pub fn set_enabled(&mut self, id: BreakpointId, enabled: bool) -> Option<BreakpointInfo> {
        let bp = self.get_mut(id)?;
        bp.enabled = enabled;
        if !enabled {
            bp.verified = false;
            bp.adapter_id = None;
        }
        Some(bp.clone())
    }

    pub fn clear_file(&mut self, path: &Path) -> Vec<BreakpointInfo> {
        self.files.remove(path).unwrap_or_default()
    }

    pub fn has_file(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn for_file(&self, path: &Path) -> Vec<BreakpointInfo> {
        self.files.get(path).cloned().unwrap_or_default()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<BreakpointInfo> {
        self.files.values().flatten().cloned().collect()
    }

    /// The full enabled set for `path`, in the order results come back.
    /// Enabled breakpoints of `path` in request order, paired with their ids.
    pub fn enabled_requests(&self, path: &Path) -> Vec<(BreakpointId, SourceBreakpoint)> {
        self.files
            .get(path)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|bp| bp.enabled)
                    .map(|bp| (bp.id, bp.to_source_breakpoint()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies verification results to the breakpoints named by `ids`, in
    /// request order. Ids removed or disabled since the request are
    /// skipped. Returns the ones that changed.
    pub fn reconcile(
        &mut self,
        path: &Path,
        ids: &[BreakpointId],
        results: &[Breakpoint],
    ) -> Vec<BreakpointInfo> {
        let Some(bucket) = self.files.get_mut(path) else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            let Some(bp) = bucket.iter_mut().find(|bp| bp.id == *id && bp.enabled) else {
                continue;
            };
            if apply_result(bp, result) {
                changed.push(bp.clone());
            }
        }
        changed
    }

    /// Applies an adapter-initiated update to the breakpoint it assigned
    /// `breakpoint.id` to.
    pub fn apply_adapter_update(
        &mut self,
        reason: &str,
        breakpoint: &Breakpoint,
    ) -> Option<BreakpointInfo> {
        let adapter_id = breakpoint.id?;
        let bp = self
            .files
            .values_mut()
            .flatten()
            .find(|bp| bp.adapter_id == Some(adapter_id))?;

        if reason == "removed" {
            bp.verified = false;
            bp.adapter_id = None;
        } else {
            apply_result(bp, breakpoint);
        }
        Some(bp.clone())
    }

    /// Forgets adapter verification, e.g. once no session is left.
    pub fn reset_verification(&mut self) {
        for bp in self.files.values_mut().flatten() {
            bp.verified = false;
            bp.adapter_id = None;
        }
    }
}

fn apply_result(bp: &mut BreakpointInfo, result: &Breakpoint) -> bool {
    let before = bp.clone();
    bp.verified = result.verified;
    bp.message = result.message.clone();
    if result.id.is_some() {
        bp.adapter_id = result.id;
    }
    if let (true, Some(line)) = (result.verified, result.line) {
        bp.line = line;
    }
    *bp != before
}
