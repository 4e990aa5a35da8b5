//! Codergen handler: prompt assembly and agent delegation.
//!
//! The prompt starts from the node's `prompt` attribute (falling back to its
//! label), substitutes `$goal`, and gains two decorations: failure feedback
//! from the previous failed stage, and the command allowlist of the
//! verification stage downstream. The assembled prompt is persisted as
//! `prompt.md` before any backend runs.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use conveyor_agent::{Agent, AgentRequest, ExternalAgent, ExternalAgentOptions, StubAgent};
use conveyor_types::{ConveyorError, Context, Outcome, OutcomeKind, Result};

use crate::graph::{NodeKind, PipelineGraph, PipelineNode};
use crate::handlers::split_csv;
use crate::handlers::verification::plan_context_key;
use crate::plan::parse_plan;

pub async fn execute(
    node: &PipelineNode,
    context: &Context,
    graph: &PipelineGraph,
    node_dir: &Path,
    workspace: &Path,
    backend: &str,
) -> Result<Outcome> {
    let prompt = build_prompt(node, context, graph);
    std::fs::write(node_dir.join("prompt.md"), format!("{}\n", prompt))?;

    if backend == "fake" {
        return execute_fake(node, context, node_dir);
    }

    let agent = resolve_agent(node, workspace, backend)?;
    let resp = agent
        .run(AgentRequest {
            prompt: &prompt,
            node_id: &node.id,
            node_dir,
            workspace,
        })
        .await?;

    let outcome_kind = OutcomeKind::parse(&resp.outcome).ok_or_else(|| {
        ConveyorError::Handler {
            handler: "codergen".into(),
            node: node.id.clone(),
            message: format!("agent returned unknown outcome: {:?}", resp.outcome),
        }
    })?;

    let mut out = Outcome::new(outcome_kind);
    out.preferred_next_label = resp.preferred_next_label;
    out.suggested_next_ids = resp.suggested_next_ids;
    out.context_updates = resp.context_updates;
    out.notes = resp.notes;
    out.failure_reason = resp.failure_reason;
    if let Some(raw_plan) = resp.verification_plan {
        let plan = parse_plan(&raw_plan, None).map_err(|e| ConveyorError::Handler {
            handler: "codergen".into(),
            node: node.id.clone(),
            message: e,
        })?;
        out.context_updates
            .insert(plan_context_key(node), serde_json::to_value(&plan)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Prompt assembly
// ---------------------------------------------------------------------------

pub fn build_prompt(node: &PipelineNode, context: &Context, graph: &PipelineGraph) -> String {
    let mut prompt = node
        .prompt
        .clone()
        .unwrap_or_else(|| node.label.clone())
        .replace("$goal", &graph.goal);
    prompt = inject_failure_feedback(&prompt, context);
    inject_verification_allowlist(&prompt, node, graph)
}

fn inject_failure_feedback(prompt: &str, context: &Context) -> String {
    let summary = context
        .get_str("last_failure.summary")
        .map(str::trim)
        .unwrap_or("");
    if summary.is_empty() {
        return prompt.to_string();
    }
    let node_id = context.get_str("last_failure.node_id").unwrap_or("").trim();
    let reason = context.get_str("last_failure.reason").unwrap_or("").trim();

    let mut out = prompt.trim_end_matches('\n').to_string();
    out.push_str("\n\nFailure feedback (from previous failed stage):\n");
    if !node_id.is_empty() {
        out.push_str(&format!("- failed_node: {}\n", node_id));
    }
    if !reason.is_empty() {
        out.push_str(&format!("- failure_reason: {}\n", reason));
    }
    out.push_str("- details:\n");
    out.push_str(summary);
    out.push('\n');
    out
}

fn inject_verification_allowlist(
    prompt: &str,
    node: &PipelineNode,
    graph: &PipelineGraph,
) -> String {
    let allowed = verification_allowed_commands_for_node(node, graph);
    if allowed.is_empty() {
        return prompt.to_string();
    }
    let mut out = prompt.trim_end_matches('\n').to_string();
    out.push_str("\n\nVerification plan command allowlist (hard requirement):\n");
    for cmd in &allowed {
        out.push_str(&format!("- {}\n", cmd));
    }
    out.push_str("Use only these command families in verification_plan.commands.\n");
    out.trim_end_matches('\n').to_string()
}

/// The command allowlist this stage must produce a plan against: an
/// explicit `verification.allowed_commands` attribute on the node wins;
/// otherwise forward edge traversal collects the allowlists of the
/// verification nodes it reaches (without searching past them).
pub fn verification_allowed_commands_for_node(
    node: &PipelineNode,
    graph: &PipelineGraph,
) -> Vec<String> {
    let explicit = unique_non_empty(split_csv(
        &node
            .attr_str("verification.allowed_commands")
            .unwrap_or_default(),
    ));
    if !explicit.is_empty() {
        return explicit;
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(node.id.clone());
    while let Some(cur) = queue.pop_front() {
        if !visited.insert(cur.clone()) {
            continue;
        }
        if cur != node.id {
            if let Some(n) = graph.node(&cur) {
                if n.kind() == NodeKind::Verification {
                    for cmd in split_csv(
                        &n.attr_str("verification.allowed_commands").unwrap_or_default(),
                    ) {
                        seen.insert(cmd);
                    }
                    continue;
                }
            }
        }
        for edge in graph.outgoing_edges(&cur) {
            queue.push_back(edge.to.clone());
        }
    }
    let mut out: Vec<String> = seen.into_iter().collect();
    out.sort();
    out
}

fn unique_non_empty(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|i| !i.is_empty() && seen.insert(i.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Deterministic fake backend
// ---------------------------------------------------------------------------

fn execute_fake(node: &PipelineNode, context: &Context, node_dir: &Path) -> Result<Outcome> {
    let outcome_tag = outcome_from_test_attrs(node, context);
    let outcome_kind = OutcomeKind::parse(&outcome_tag).ok_or_else(|| {
        ConveyorError::Handler {
            handler: "codergen".into(),
            node: node.id.clone(),
            message: format!("unknown test outcome: {:?}", outcome_tag),
        }
    })?;

    std::fs::write(
        node_dir.join("response.md"),
        format!("outcome={}\n", outcome_tag),
    )?;

    let mut out = Outcome::new(outcome_kind);
    out.preferred_next_label = node.attr_str("test.preferred_next_label").unwrap_or_default();
    out.suggested_next_ids = split_csv(
        &node.attr_str("test.suggested_next_ids").unwrap_or_default(),
    );
    out.notes = node
        .attr_str("test.notes")
        .unwrap_or_else(|| "fake backend".to_string());

    if let Some(raw) = node.attr_str("test.verification_plan_json") {
        let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            ConveyorError::Handler {
                handler: "codergen".into(),
                node: node.id.clone(),
                message: format!("invalid test.verification_plan_json: {}", e),
            }
        })?;
        let plan = parse_plan(&parsed, None).map_err(|e| ConveyorError::Handler {
            handler: "codergen".into(),
            node: node.id.clone(),
            message: e,
        })?;
        out.context_updates
            .insert(plan_context_key(node), serde_json::to_value(&plan)?);
    }
    Ok(out)
}

/// `test.outcome_sequence` is indexed by the node's retry count, so one
/// node can script `retry,retry,success` across attempts. Past the end of
/// the sequence the last entry repeats.
fn outcome_from_test_attrs(node: &PipelineNode, context: &Context) -> String {
    let seq = split_csv(&node.attr_str("test.outcome_sequence").unwrap_or_default());
    if !seq.is_empty() {
        let idx = context
            .get(&format!("internal.retry_count.{}", node.id))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        return seq.get(idx).unwrap_or(seq.last().expect("non-empty")).clone();
    }
    node.attr_str("test.outcome")
        .unwrap_or_else(|| "success".to_string())
}

// ---------------------------------------------------------------------------
// Agent backend resolution
// ---------------------------------------------------------------------------

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> bool {
    matches!(
        env_str(key).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|v| v.parse().ok())
}

fn resolve_agent(
    node: &PipelineNode,
    workspace: &Path,
    engine_backend: &str,
) -> Result<Box<dyn Agent>> {
    let name = node
        .attr_str("agent.backend")
        .or_else(|| {
            let b = engine_backend.trim();
            if b.is_empty() {
                None
            } else {
                Some(b.to_string())
            }
        })
        .unwrap_or_else(|| "stub".to_string());
    match name.as_str() {
        "stub" => Ok(Box::new(StubAgent)),
        "external" => {
            let opts = external_options_from_node_and_env(node, workspace)?;
            Ok(Box::new(ExternalAgent::new(opts)))
        }
        other => Err(ConveyorError::Other(format!(
            "unknown agent backend: {}",
            other
        ))),
    }
}

fn external_options_from_node_and_env(
    node: &PipelineNode,
    workspace: &Path,
) -> Result<ExternalAgentOptions> {
    let executable = node
        .attr_str("agent.path")
        .or_else(|| env_str("CONVEYOR_AGENT_PATH"))
        .ok_or_else(|| {
            ConveyorError::Other(
                "agent.path (or CONVEYOR_AGENT_PATH) is required for the external backend".into(),
            )
        })?;

    let workdir = resolve_dir(
        workspace,
        &node
            .attr_str("agent.workdir")
            .or_else(|| env_str("CONVEYOR_AGENT_WORKDIR"))
            .unwrap_or_default(),
    )?;
    let mut add_dirs = Vec::new();
    for p in split_csv(
        &node
            .attr_str("agent.add_dirs")
            .or_else(|| env_str("CONVEYOR_AGENT_ADD_DIRS"))
            .unwrap_or_default(),
    ) {
        add_dirs.push(resolve_dir(workspace, &p)?);
    }

    let mut blocked = Vec::new();
    if !node.attr_bool("agent.allow_read_scenarios", false) {
        blocked.push("scripts/scenarios/".to_string());
    }
    blocked.extend(split_csv(
        &node
            .attr_str("agent.block_read_paths")
            .or_else(|| env_str("CONVEYOR_AGENT_BLOCK_READ_PATHS"))
            .unwrap_or_default(),
    ));
    let blocked = validate_relative_paths(&blocked)?;

    let timeout_secs = node.attr_int("agent.timeout_seconds", 0).max(0) as u64;
    let timeout_secs = if timeout_secs > 0 {
        timeout_secs
    } else {
        env_u64("CONVEYOR_AGENT_TIMEOUT_SECONDS").unwrap_or(0)
    };
    let heartbeat_secs = node.attr_int("agent.heartbeat_seconds", 0).max(0) as u64;
    let heartbeat_secs = if heartbeat_secs > 0 {
        heartbeat_secs
    } else {
        env_u64("CONVEYOR_AGENT_HEARTBEAT_SECONDS").unwrap_or(15)
    };

    let mut opts = ExternalAgentOptions::new(executable, workdir);
    opts.add_dirs = add_dirs;
    opts.block_read_paths = blocked;
    opts.strict_read_scope = node.attr_bool("agent.strict_read_scope", false)
        || env_bool("CONVEYOR_AGENT_STRICT_READ_SCOPE");
    opts.timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
    opts.heartbeat = Duration::from_secs(heartbeat_secs.max(1));
    Ok(opts)
}

/// Resolve a directory attribute under the workspace. Absolute paths pass
/// through; relative paths may not contain `~` or parent segments.
fn resolve_dir(workspace: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Ok(workspace.to_path_buf());
    }
    if Path::new(p).is_absolute() {
        return Ok(PathBuf::from(p));
    }
    if p.contains('~') {
        return Err(ConveyorError::Other(format!(
            "path {:?} contains unsupported ~",
            p
        )));
    }
    for seg in p.split('/') {
        if seg == ".." {
            return Err(ConveyorError::Other(format!(
                "path {:?} contains parent segment",
                p
            )));
        }
    }
    Ok(workspace.join(p))
}

fn validate_relative_paths(paths: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for p in paths {
        let p = p.trim();
        if p.is_empty() {
            continue;
        }
        if p.starts_with('/') {
            return Err(ConveyorError::Other(format!(
                "path {:?} must be relative",
                p
            )));
        }
        for seg in p.trim_end_matches('/').split('/') {
            if seg == ".." {
                return Err(ConveyorError::Other(format!(
                    "path {:?} contains parent segment",
                    p
                )));
            }
        }
        if seen.insert(p.to_string()) {
            out.push(p.to_string());
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
