//! Static guardrails on tool commands and write allowlists.
//!
//! These checks run before (command shape) or after (write allowlist,
//! unfixable failure source) a stage executes. A tripped guardrail is a
//! stage-level `fail` outcome or, for the unfixable-failure-source check, a
//! run-terminating error.

use conveyor_types::Context;

use crate::graph::{NodeKind, PipelineGraph, PipelineNode};

/// Reject tool command strings that could reach outside the workspace:
/// `~` anywhere, `..` as a path-segment token, or any token that starts
/// with `/` after stripping surrounding quotes. Embedded `..` inside a
/// larger word (`./...`) is allowed.
pub fn validate_tool_command(cmd: &str) -> Result<(), String> {
    if cmd.contains('~') {
        return Err("tool_command rejected by guardrail: contains ~".into());
    }
    if contains_parent_segment_token(cmd) {
        return Err("tool_command rejected by guardrail: contains ..".into());
    }
    for tok in cmd.split_whitespace() {
        let t = tok.trim_matches(|c| c == '\'' || c == '"');
        if t.starts_with('/') {
            return Err("tool_command rejected by guardrail: contains absolute path".into());
        }
    }
    Ok(())
}

fn contains_parent_segment_token(cmd: &str) -> bool {
    let bytes = cmd.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] != b'.' || bytes[i + 1] != b'.' {
            i += 1;
            continue;
        }
        let prev_boundary = i == 0 || is_path_token_boundary(bytes[i - 1]);
        let next_boundary = i + 2 >= bytes.len() || is_path_token_boundary(bytes[i + 2]);
        if prev_boundary && next_boundary {
            return true;
        }
        i += 1;
    }
    false
}

fn is_path_token_boundary(b: u8) -> bool {
    matches!(
        b,
        b'/' | b' ' | b'\t' | b'\n' | b'\r' | b';' | b'&' | b'|' | b'(' | b')' | b'\'' | b'"'
    )
}

/// Parse and validate the node's `allowed_write_paths` attribute
/// (comma-separated). Empty entries, absolute paths, and parent segments
/// are rejected. An absent attribute yields an empty list, meaning no
/// allowlist is enforced.
pub fn parse_allowed_write_paths(node: &PipelineNode) -> Result<Vec<String>, String> {
    let raw = match node.attr_str("allowed_write_paths") {
        Some(raw) => raw,
        None => return Ok(Vec::new()),
    };
    let mut out = Vec::new();
    for part in raw.split(',') {
        let p = part.trim();
        if p.is_empty() {
            return Err("allowed_write_paths contains empty entry".into());
        }
        if p.starts_with('/') {
            return Err(format!("allowed_write_paths contains absolute path: {}", p));
        }
        if p.contains("..") {
            return Err(format!("allowed_write_paths contains parent segment: {}", p));
        }
        out.push(p.to_string());
    }
    Ok(out)
}

/// Only tool and codergen stages have their workspace writes policed;
/// verification output is confined to its own artifact directory.
pub fn is_executable_node(node: &PipelineNode) -> bool {
    matches!(node.kind(), NodeKind::Tool | NodeKind::Codergen)
}

/// Path-like tokens ending in `.sh` from a tool command, excluding flags
/// and env assignments.
pub fn extract_tool_script_paths(cmd: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for tok in cmd.split_whitespace() {
        let t = tok.trim_matches(|c| c == '\'' || c == '"');
        if t.is_empty() || t.starts_with('-') || t.contains('=') {
            continue;
        }
        if t.ends_with(".sh") {
            paths.push(clean_rel_path(t));
        }
    }
    paths
}

fn clean_rel_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.push("..");
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// When a codergen stage is about to run after a tool failure, check whether
/// the failed tool command references `*.sh` scripts the codergen stage is
/// not allowed to modify. If so the fix loop can never converge and the run
/// must abort.
///
/// Returns `Some(reason)` when execution must not proceed.
pub fn unfixable_failure_source(
    graph: &PipelineGraph,
    context: &Context,
    node: &PipelineNode,
) -> Option<String> {
    if node.kind() != NodeKind::Codergen {
        return None;
    }
    let failed_id = context.get_str("last_failure.node_id")?.trim();
    if failed_id.is_empty() {
        return None;
    }
    let failed_node = graph.node(failed_id)?;
    if failed_node.kind() != NodeKind::Tool {
        return None;
    }
    let cmd = failed_node.attr_str("tool_command")?;
    let source_paths = extract_tool_script_paths(&cmd);
    if source_paths.is_empty() {
        return None;
    }
    let allowed = match parse_allowed_write_paths(node) {
        Ok(a) => a,
        Err(e) => {
            return Some(format!(
                "invalid allowed_write_paths on node {}: {}",
                node.id, e
            ))
        }
    };
    if allowed.is_empty() {
        return None;
    }
    let mut outside: Vec<String> = source_paths
        .into_iter()
        .filter(|src| !crate::workspace::path_allowed(src, &allowed))
        .collect();
    if outside.is_empty() {
        return None;
    }
    outside.sort();
    Some(format!(
        "unfixable_failure_source: failed node {} references {} outside allowed_write_paths for {}",
        failed_id,
        outside.join(","),
        node.id
    ))
}
