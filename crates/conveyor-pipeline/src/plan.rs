//! Verification plan parsing and path normalization.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Required workspace files plus the commands that attest correctness.
/// Produced by codergen stages (via context) and consumed by verification
/// stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationPlan {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Parse a plan from raw JSON, normalizing file paths and requiring at
/// least one non-empty command. When `workspace` is given, absolute file
/// paths that resolve under it are rewritten relative; otherwise absolute
/// paths are rejected outright.
pub fn parse_plan(
    raw: &serde_json::Value,
    workspace: Option<&Path>,
) -> Result<VerificationPlan, String> {
    let mut plan: VerificationPlan = serde_json::from_value(raw.clone())
        .map_err(|e| format!("invalid verification plan: {}", e))?;
    for f in &mut plan.files {
        *f = normalize_plan_path(f, workspace)
            .map_err(|e| format!("invalid verification file path {:?}: {}", f, e))?;
    }
    for c in &mut plan.commands {
        let trimmed = c.trim();
        if trimmed.is_empty() {
            return Err("verification command cannot be empty".into());
        }
        *c = trimmed.to_string();
    }
    if plan.commands.is_empty() {
        return Err("verification plan must contain at least one command".into());
    }
    Ok(plan)
}

fn normalize_plan_path(p: &str, workspace: Option<&Path>) -> Result<String, String> {
    let p = p.trim();
    if p.is_empty() {
        return Err("path is empty".into());
    }
    if p.contains('~') {
        return Err("~ is not allowed".into());
    }
    let mut rel = p.to_string();
    if p.starts_with('/') {
        let workspace = workspace.ok_or_else(|| "absolute paths are not allowed".to_string())?;
        let stripped = Path::new(p)
            .strip_prefix(workspace)
            .map_err(|_| "absolute path is not under workspace".to_string())?;
        rel = stripped.to_string_lossy().into_owned();
        if rel.is_empty() {
            return Err("absolute path is not under workspace".into());
        }
    }
    let mut parts = Vec::new();
    for seg in rel.split('/') {
        match seg {
            "" | "." => {}
            ".." => return Err("parent path segments are not allowed".into()),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err("path is empty".into());
    }
    Ok(parts.join("/"))
}
