//! Hide-and-restore read scoping for external agents.
//!
//! Before an external agent runs, blocked workspace subtrees are renamed
//! into a run-scoped holding directory under the node's artifact dir; after
//! the process exits they are renamed back in reverse order. Renames stay on
//! the same filesystem, so the operation is cheap and reversible. If the
//! agent recreated a blocked path while it was hidden, restoration fails
//! loudly rather than overwriting what the agent produced.

use std::fs;
use std::path::{Path, PathBuf};

use conveyor_types::{ConveyorError, Result};

/// One entry moved out of the workspace, remembered so it can be moved back.
#[derive(Debug)]
pub struct HiddenPath {
    pub original: PathBuf,
    pub hidden: PathBuf,
}

/// Restores hidden paths when dropped, so a panic or early return cannot
/// leave the workspace missing its blocked entries. Call [`restore`] on the
/// normal path to surface restore errors; `Drop` only logs them.
///
/// [`restore`]: RestoreGuard::restore
#[derive(Debug, Default)]
pub struct RestoreGuard {
    entries: Vec<HiddenPath>,
    armed: bool,
}

impl RestoreGuard {
    pub fn new(entries: Vec<HiddenPath>) -> Self {
        Self {
            armed: !entries.is_empty(),
            entries,
        }
    }

    pub fn extend(&mut self, entries: Vec<HiddenPath>) {
        if !entries.is_empty() {
            self.armed = true;
        }
        self.entries.extend(entries);
    }

    /// Put every hidden entry back, most recently hidden first.
    pub fn restore(&mut self) -> Result<()> {
        self.armed = false;
        restore_paths(&self.entries)
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = restore_paths(&self.entries) {
                tracing::error!(error = %e, "failed to restore hidden workspace paths");
            }
        }
    }
}

/// Validate a workspace-relative block entry: non-empty, relative, no
/// parent segments.
fn validate_block_entry(rel: &str) -> Result<()> {
    if rel.starts_with('/') {
        return Err(ConveyorError::Other(format!(
            "blocked read path {:?} must be relative",
            rel
        )));
    }
    for seg in rel.split('/') {
        if seg == ".." {
            return Err(ConveyorError::Other(format!(
                "blocked read path {:?} contains parent segment",
                rel
            )));
        }
    }
    Ok(())
}

fn create_hidden_base(node_dir: &Path) -> Result<PathBuf> {
    for i in 0u32.. {
        let candidate = node_dir.join(format!(".hidden_read_paths.{}", i));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("u32 range exhausted creating hidden base dir")
}

/// Move each existing blocked entry out of the workspace into a holding
/// directory under `node_dir`. Entries that do not exist are skipped.
/// Returns the moves in the order they were performed.
pub fn hide_paths(
    workspace: &Path,
    node_dir: &Path,
    blocked: &[String],
) -> Result<Vec<HiddenPath>> {
    if blocked.is_empty() {
        return Ok(Vec::new());
    }
    let base = create_hidden_base(node_dir)?;

    let mut paths: Vec<&str> = blocked
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    paths.sort_unstable();

    let mut hidden = Vec::with_capacity(paths.len());
    for rel in paths {
        let rel = rel.trim_end_matches('/');
        validate_block_entry(rel)?;
        let original = workspace.join(rel);
        match fs::symlink_metadata(&original) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
        let dst = base.join(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = fs::rename(&original, &dst) {
            let _ = restore_paths(&hidden);
            return Err(e.into());
        }
        hidden.push(HiddenPath {
            original,
            hidden: dst,
        });
    }
    Ok(hidden)
}

/// Reverse of [`hide_paths`]: rename entries back, most recent first.
/// Errors if an original path was recreated while hidden.
pub fn restore_paths(hidden: &[HiddenPath]) -> Result<()> {
    for h in hidden.iter().rev() {
        if let Some(parent) = h.original.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::symlink_metadata(&h.original) {
            Ok(_) => {
                return Err(ConveyorError::Other(format!(
                    "blocked path was recreated during execution: {}",
                    h.original.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::rename(&h.hidden, &h.original)?;
    }
    Ok(())
}

/// Compute the top-level workspace entries to hide under strict read scope:
/// everything except the roots holding the agent's workdir, its additional
/// read directories, and its own executable.
pub fn strict_scope_blocked(
    workspace: &Path,
    workdir: &Path,
    add_dirs: &[PathBuf],
    executable: &str,
) -> Result<Vec<String>> {
    let mut keep_roots: Vec<String> = Vec::new();
    let mut add_keep_root = |p: &Path| {
        let rel = match p.strip_prefix(workspace) {
            Ok(rel) => rel,
            Err(_) if p.is_relative() => p,
            Err(_) => return,
        };
        if let Some(root) = rel.components().next() {
            let root = root.as_os_str().to_string_lossy().to_string();
            if !root.is_empty() && root != "." && !keep_roots.contains(&root) {
                keep_roots.push(root);
            }
        }
    };
    add_keep_root(workdir);
    for d in add_dirs {
        add_keep_root(d);
    }
    if !executable.is_empty() {
        add_keep_root(Path::new(executable));
    }
    if keep_roots.is_empty() {
        return Ok(Vec::new());
    }

    let mut blocked = Vec::new();
    for entry in fs::read_dir(workspace)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if keep_roots.contains(&name) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            blocked.push(format!("{}/", name));
        } else {
            blocked.push(name);
        }
    }
    blocked.sort_unstable();
    Ok(blocked)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
