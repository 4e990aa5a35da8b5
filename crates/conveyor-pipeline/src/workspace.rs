//! Per-run workspace: population, content snapshots, and diffs.
//!
//! The snapshot/diff pair is the only evidence the write-allowlist guardrail
//! uses: hash everything before a handler runs, hash again after, and compare.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use conveyor_types::Result;

/// Size and SHA-256 content hash of one regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub size: u64,
    pub hash: String,
}

/// Workspace-relative path (forward-slash form) to file state. Directories
/// are not recorded.
pub type Snapshot = BTreeMap<String, FileState>;

/// Hash every regular file under `workspace`.
pub fn snapshot(workspace: &Path) -> Result<Snapshot> {
    let mut out = Snapshot::new();
    for entry in WalkDir::new(workspace) {
        let entry = entry.map_err(|e| {
            conveyor_types::ConveyorError::Other(format!("workspace walk failed: {}", e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .expect("walkdir yields paths under its root");
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = std::fs::read(entry.path())?;
        let hash = hex::encode(Sha256::digest(&bytes));
        out.insert(
            rel,
            FileState {
                size: bytes.len() as u64,
                hash,
            },
        );
    }
    Ok(out)
}

/// Sorted created/modified/deleted lists between two snapshots.
/// Persisted per node as `workspace.diff.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceDiff {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl WorkspaceDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

pub fn diff(before: &Snapshot, after: &Snapshot) -> WorkspaceDiff {
    let mut d = WorkspaceDiff::default();
    for (path, a) in after {
        match before.get(path) {
            None => d.created.push(path.clone()),
            Some(b) if b.hash != a.hash || b.size != a.size => d.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            d.deleted.push(path.clone());
        }
    }
    // BTreeMap iteration is already ordered, but make the contract explicit.
    d.created.sort();
    d.modified.sort();
    d.deleted.sort();
    d
}

/// Allowlist predicate. An entry with a trailing `/` matches the directory
/// itself and anything beneath it; any other entry matches exactly.
pub fn path_allowed(path: &str, allowed: &[String]) -> bool {
    let path = path.trim();
    for entry in allowed {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some(dir) = entry.strip_suffix('/') {
            if path == dir || path.starts_with(&format!("{}/", dir)) {
                return true;
            }
            continue;
        }
        if path == entry {
            return true;
        }
    }
    false
}

/// Diff entries not covered by the allowlist, sorted.
pub fn disallowed_paths(diff: &WorkspaceDiff, allowed: &[String]) -> Vec<String> {
    let mut violations: Vec<String> = diff
        .created
        .iter()
        .chain(diff.modified.iter())
        .chain(diff.deleted.iter())
        .filter(|p| !path_allowed(p, allowed))
        .cloned()
        .collect();
    violations.sort();
    violations
}

/// Copy `src` into `dst`, skipping `excludes` (workspace-relative,
/// forward-slash). File modes are preserved (`fs::copy` carries
/// permissions), so executable bits survive.
pub fn copy_dir(src: &Path, dst: &Path, excludes: &[String]) -> Result<()> {
    let norm_excludes: Vec<String> = excludes
        .iter()
        .map(|e| e.trim().trim_matches('/').to_string())
        .filter(|e| !e.is_empty() && e != ".")
        .collect();

    let mut walker = WalkDir::new(src).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry
            .map_err(|e| conveyor_types::ConveyorError::Other(format!("copy walk failed: {}", e)))?;
        if entry.path() == src {
            continue;
        }
        let rel_path = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let rel = rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if should_skip(&rel, &norm_excludes) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        let target = dst.join(rel_path);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks and other special files are not carried into the workspace.
    }
    Ok(())
}

fn should_skip(rel: &str, excludes: &[String]) -> bool {
    excludes
        .iter()
        .any(|ex| rel == ex || rel.starts_with(&format!("{}/", ex)))
}

/// If `child` is a strict descendant of `parent`, return its relative path
/// in forward-slash form. Purely lexical; neither path needs to exist.
pub fn relative_descendant(parent: &Path, child: &Path) -> Option<String> {
    let parent = normalize(parent);
    let child = normalize(child);
    let rel = child.strip_prefix(&parent).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
