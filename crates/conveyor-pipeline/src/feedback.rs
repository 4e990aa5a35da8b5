//! Failure feedback: artifact inventory and bounded summaries.
//!
//! When a stage fails, the engine records what evidence exists on disk and
//! distills it into a summary small enough to ride along in the next agent
//! prompt. The summary lives under `last_failure.*` context keys until the
//! next failure overwrites it.

use std::path::Path;

use conveyor_types::{Context, Outcome};

use crate::events::now_rfc3339;
use crate::graph::PipelineNode;

/// Total cap on the assembled summary.
const SUMMARY_MAX_CHARS: usize = 2200;
/// Default tail window per artifact.
const TAIL_BYTES: usize = 600;
/// Stdout gets a shorter window; it is usually the noisiest.
const STDOUT_TAIL_BYTES: usize = 300;

/// Artifact files a failed node may have produced, as (key, filename).
const ARTIFACT_CANDIDATES: [(&str, &str); 10] = [
    ("status", "status.json"),
    ("tool_stdout", "tool.stdout.txt"),
    ("tool_stderr", "tool.stderr.txt"),
    ("tool_exitcode", "tool.exitcode.txt"),
    ("verification_plan", "verification.plan.json"),
    ("verification_results", "verification.results.json"),
    ("agent_stdout", "agent.stdout.log"),
    ("agent_stderr", "agent.stderr.log"),
    ("agent_response", "response.md"),
    ("workspace_diff", "workspace.diff.json"),
];

/// Read the last `max` bytes of a file, trimmed. `None` when the file is
/// missing or effectively empty.
pub fn tail_snippet(path: &Path, max: usize) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.is_empty() {
        return None;
    }
    let max = if max == 0 { TAIL_BYTES } else { max };
    let start = bytes.len().saturating_sub(max);
    let tail = String::from_utf8_lossy(&bytes[start..]);
    let tail = tail.trim();
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

/// Record the failure under the well-known context keys. Must run before
/// any subsequent handler executes.
pub fn capture_failure_feedback(
    context: &mut Context,
    node: &PipelineNode,
    node_dir: &Path,
    outcome: &Outcome,
) {
    let mut artifacts = serde_json::Map::new();
    for (key, file) in ARTIFACT_CANDIDATES {
        let p = node_dir.join(file);
        if p.exists() {
            artifacts.insert(
                key.to_string(),
                serde_json::Value::String(p.to_string_lossy().into_owned()),
            );
        }
    }
    context.set("last_failure.node_id", serde_json::json!(node.id));
    context.set(
        "last_failure.node_type",
        serde_json::json!(node.kind().as_str()),
    );
    context.set(
        "last_failure.reason",
        serde_json::json!(outcome.failure_reason),
    );
    context.set("last_failure.at", serde_json::json!(now_rfc3339()));
    context.set(
        "last_failure.artifacts",
        serde_json::Value::Object(artifacts),
    );
    context.set(
        "last_failure.summary",
        serde_json::json!(build_failure_summary(node, node_dir, outcome)),
    );
}

/// Concatenate labeled tail snippets into a bounded plain-text summary.
pub fn build_failure_summary(node: &PipelineNode, node_dir: &Path, outcome: &Outcome) -> String {
    let mut parts = vec![
        format!("failed_node={}", node.id),
        format!("failed_node_type={}", node.kind().as_str()),
    ];
    if !outcome.failure_reason.trim().is_empty() {
        parts.push(format!("failure_reason={}", outcome.failure_reason));
    }
    if let Some(code) = tail_snippet(&node_dir.join("tool.exitcode.txt"), 64) {
        parts.push(format!("tool_exit_code={}", code.trim()));
    }
    if let Some(s) = tail_snippet(&node_dir.join("tool.stderr.txt"), TAIL_BYTES) {
        parts.push(format!("tool_stderr:\n{}", s));
    }
    if let Some(s) = tail_snippet(&node_dir.join("tool.stdout.txt"), STDOUT_TAIL_BYTES) {
        parts.push(format!("tool_stdout:\n{}", s));
    }
    if let Some(s) = tail_snippet(&node_dir.join("verification.results.json"), TAIL_BYTES) {
        parts.push(format!("verification_results_tail:\n{}", s));
    }
    if let Some(s) = tail_snippet(&node_dir.join("agent.stderr.log"), TAIL_BYTES) {
        parts.push(format!("agent_stderr_tail:\n{}", s));
    }
    let summary = parts.join("\n");
    truncate_chars(&summary, SUMMARY_MAX_CHARS).trim().to_string()
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Log which failure artifacts exist and the most diagnostic tails.
pub fn log_failure_context(node: &PipelineNode, node_dir: &Path) {
    let mut present: Vec<String> = Vec::new();
    for (key, file) in ARTIFACT_CANDIDATES {
        let p = node_dir.join(file);
        if p.exists() {
            present.push(format!("{}={}", key, p.display()));
        }
    }
    tracing::warn!(node = %node.id, artifacts = %present.join(" "), "failure artifacts");

    for source in [
        "tool.stderr.txt",
        "tool.stdout.txt",
        "agent.stderr.log",
        "response.md",
    ] {
        if let Some(tail) = tail_snippet(&node_dir.join(source), TAIL_BYTES) {
            tracing::warn!(node = %node.id, source = source, snippet = %tail, "failure detail");
        }
    }
}
