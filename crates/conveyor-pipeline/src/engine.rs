//! The execution loop: run setup, stage lifecycle, retries, routing, resume.
//!
//! One stage executes at a time. Each visit follows the same order:
//! snapshot, execute, snapshot, diff, guardrail check, persist status,
//! apply context updates, checkpoint, route. Events and trace records are
//! appended at fixed points so a crashed run can always be resumed from its
//! last checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use conveyor_types::{ConveyorError, Context, Outcome, OutcomeKind, Result};

use crate::checkpoint::{load_checkpoint, save_checkpoint, Checkpoint};
use crate::events::{attr_map_to_json, now_rfc3339, read_json, write_json, Event, JsonlLog, TraceRecord};
use crate::feedback::{capture_failure_feedback, log_failure_context};
use crate::graph::{NodeKind, PipelineGraph, PipelineNode};
use crate::guardrail::{is_executable_node, parse_allowed_write_paths, unfixable_failure_source};
use crate::routing::{route_candidates, select_next};
use crate::validation::validate_or_raise;
use crate::workspace;

/// Delay between retry attempts of one stage.
const RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Environment hooks; explicit [`RunConfig`] fields take precedence.
pub const BACKEND_ENV: &str = "CONVEYOR_BACKEND";
pub const TEST_STOP_ENV: &str = "CONVEYOR_TEST_STOP_AFTER_NODE";

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub pipeline_path: PathBuf,
    /// Source directory copied into the per-run workspace.
    pub workdir: PathBuf,
    /// Parent directory for run directories.
    pub runs_dir: PathBuf,
    /// Defaults to a UTC timestamp; required when resuming.
    pub run_id: Option<String>,
    pub resume: bool,
    /// Codergen backend selector; falls back to `CONVEYOR_BACKEND`.
    pub backend: Option<String>,
    /// Abort (with a `test_stop` error) after the named node checkpoints;
    /// falls back to `CONVEYOR_TEST_STOP_AFTER_NODE`.
    pub stop_after_node: Option<String>,
}

impl RunConfig {
    pub fn new(
        pipeline_path: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline_path: pipeline_path.into(),
            workdir: workdir.into(),
            runs_dir: runs_dir.into(),
            run_id: None,
            resume: false,
            backend: None,
            stop_after_node: None,
        }
    }
}

struct Engine {
    graph: PipelineGraph,
    run_id: String,
    run_dir: PathBuf,
    workspace: PathBuf,
    context: Context,
    retry_counts: BTreeMap<String, u64>,
    completed: BTreeSet<String>,
    events: JsonlLog,
    trace: JsonlLog,
    backend: String,
    stop_after_node: Option<String>,
}

/// Parse, validate, and execute the pipeline named by `cfg`, or resume it.
pub async fn run_pipeline(cfg: RunConfig) -> Result<()> {
    tracing::info!(
        pipeline_path = %cfg.pipeline_path.display(),
        workdir = %cfg.workdir.display(),
        runs_dir = %cfg.runs_dir.display(),
        resume = cfg.resume,
        "pipeline starting"
    );
    let source = std::fs::read_to_string(&cfg.pipeline_path)?;
    let graph = PipelineGraph::from_dot(conveyor_dot::parse(&source)?);
    validate_or_raise(&graph)?;

    let run_id = match (&cfg.run_id, cfg.resume) {
        (Some(id), _) => id.clone(),
        (None, true) => {
            return Err(ConveyorError::Other(
                "run id is required when resuming".into(),
            ))
        }
        (None, false) => chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string(),
    };
    let run_dir = cfg.runs_dir.join(&run_id);
    let ws = run_dir.join("workspace");

    if !cfg.resume {
        std::fs::create_dir_all(&ws)?;
        let mut excludes = vec![".git".to_string()];
        if let Some(rel_runs) = workspace::relative_descendant(&cfg.workdir, &cfg.runs_dir) {
            tracing::info!(relative_path = %rel_runs, "excluding runs directory from workspace copy");
            excludes.push(rel_runs);
        }
        workspace::copy_dir(&cfg.workdir, &ws, &excludes)?;
    }
    std::fs::create_dir_all(&run_dir)?;
    write_manifest(&graph, &cfg, &run_dir, &ws)?;

    let events = JsonlLog::new(run_dir.join("events.jsonl"));
    let trace = JsonlLog::new(run_dir.join("trace.jsonl"));
    trace.append(&TraceRecord::SessionInitialized {
        run_id: run_id.clone(),
        pipeline_path: cfg.pipeline_path.display().to_string(),
        workdir: cfg.workdir.display().to_string(),
        workspace: ws.display().to_string(),
        resume: cfg.resume,
    })?;

    let backend = cfg
        .backend
        .clone()
        .or_else(|| std::env::var(BACKEND_ENV).ok())
        .map(|b| b.trim().to_string())
        .unwrap_or_default();
    let stop_after_node = cfg
        .stop_after_node
        .clone()
        .or_else(|| std::env::var(TEST_STOP_ENV).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut engine = Engine {
        run_id: run_id.clone(),
        run_dir: run_dir.clone(),
        workspace: ws,
        context: Context::new(),
        retry_counts: BTreeMap::new(),
        completed: BTreeSet::new(),
        events,
        trace,
        backend,
        stop_after_node,
        graph,
    };
    if !engine.graph.goal.is_empty() {
        engine
            .context
            .set("graph.goal", serde_json::json!(engine.graph.goal));
    }

    let start = engine
        .graph
        .start_node()
        .ok_or_else(|| ConveyorError::Validation("must have exactly one start node".into()))?;
    let mut start_id = start.id.clone();

    if cfg.resume {
        let cp = load_checkpoint(&run_dir.join("checkpoint.json"))?;
        engine.context = cp.context;
        engine.retry_counts = cp.retry_counts;
        engine.completed = cp.completed_nodes.iter().cloned().collect();
        if !cp.last_completed_node.is_empty() {
            let status: Outcome =
                read_json(&run_dir.join(&cp.last_completed_node).join("status.json"))?;
            engine.trace.append(&TraceRecord::ResumeLoaded {
                last_completed_node: cp.last_completed_node.clone(),
                last_outcome: status.outcome.as_str().to_string(),
                completed_nodes: cp.completed_nodes.clone(),
            })?;
            let next = select_next(&engine.graph, &cp.last_completed_node, status.outcome)
                .map(|e| e.to.clone());
            match next {
                Some(next) => start_id = next,
                None => {
                    let last_is_exit = engine
                        .graph
                        .node(&cp.last_completed_node)
                        .map(|n| n.is_exit())
                        .unwrap_or(false);
                    if last_is_exit {
                        return Ok(());
                    }
                    return Err(ConveyorError::ResumeMismatch {
                        node: cp.last_completed_node,
                    });
                }
            }
        }
    }

    engine.events.append(&Event::PipelineStarted {
        run_id: run_id.clone(),
    })?;
    engine.trace.append(&TraceRecord::PipelineStarted {
        run_id: run_id.clone(),
        start_node: start_id.clone(),
    })?;
    tracing::info!(
        run_id = %run_id,
        run_dir = %run_dir.display(),
        start_node = %start_id,
        "pipeline execution started"
    );

    match engine.execute_from(start_id).await {
        Ok(()) => {
            engine.events.append(&Event::PipelineCompleted {})?;
            engine.trace.append(&TraceRecord::PipelineCompleted {})?;
            tracing::info!(run_id = %run_id, "pipeline completed");
            Ok(())
        }
        Err(e) => {
            engine.events.append(&Event::PipelineFailed {
                error: e.to_string(),
            })?;
            engine.trace.append(&TraceRecord::PipelineFailed {
                error: e.to_string(),
            })?;
            tracing::error!(run_id = %run_id, error = %e, "pipeline failed");
            Err(e)
        }
    }
}

fn write_manifest(
    graph: &PipelineGraph,
    cfg: &RunConfig,
    run_dir: &Path,
    workspace: &Path,
) -> Result<()> {
    let mut manifest = serde_json::json!({
        "schema_version": 1,
        "pipeline_path": cfg.pipeline_path.display().to_string(),
        "original_workdir": cfg.workdir.display().to_string(),
        "workspace_path": workspace.display().to_string(),
        "started_at": now_rfc3339(),
    });
    if !graph.goal.is_empty() {
        manifest["goal"] = serde_json::json!(graph.goal);
    }
    write_json(&run_dir.join("manifest.json"), &manifest)
}

impl Engine {
    async fn execute_from(&mut self, start_id: String) -> Result<()> {
        let mut current = start_id;
        loop {
            let node = self
                .graph
                .node(&current)
                .cloned()
                .ok_or_else(|| ConveyorError::Other(format!("missing node: {}", current)))?;
            let node_dir = self.run_dir.join(&node.id);
            std::fs::create_dir_all(&node_dir)?;

            self.events.append(&Event::StageStarted {
                node_id: node.id.clone(),
            })?;
            tracing::info!(node = %node.id, kind = node.kind().as_str(), shape = %node.shape, "stage started");

            let context_before = self.context.clone();
            self.trace.append(&TraceRecord::NodeInputCaptured {
                node_id: node.id.clone(),
                node_kind: node.kind().as_str().to_string(),
                node_shape: node.shape.clone(),
                node_attrs: attr_map_to_json(&node.raw_attrs),
                context_before: context_before.clone(),
                workspace: self.workspace.display().to_string(),
                node_artifact_dir: node_dir.display().to_string(),
            })?;
            self.context.set("current_node", serde_json::json!(node.id));

            let out = match self.execute_node(&node, &node_dir).await {
                Ok(out) => out,
                Err(e) => {
                    self.events.append(&Event::StageFailed {
                        node_id: node.id.clone(),
                        failure_reason: None,
                        error: Some(e.to_string()),
                    })?;
                    self.trace.append(&TraceRecord::NodeExecutionErrored {
                        node_id: node.id.clone(),
                        error: e.to_string(),
                    })?;
                    tracing::error!(node = %node.id, error = %e, "stage execution errored");
                    log_failure_context(&node, &node_dir);
                    return Err(e);
                }
            };
            write_json(&node_dir.join("status.json"), &out)?;

            if out.outcome == OutcomeKind::Fail {
                self.events.append(&Event::StageFailed {
                    node_id: node.id.clone(),
                    failure_reason: Some(out.failure_reason.clone()),
                    error: None,
                })?;
                tracing::warn!(node = %node.id, reason = %out.failure_reason, "stage failed");
                log_failure_context(&node, &node_dir);
            } else {
                self.events.append(&Event::StageCompleted {
                    node_id: node.id.clone(),
                    outcome: out.outcome.as_str().to_string(),
                })?;
                tracing::info!(node = %node.id, outcome = out.outcome.as_str(), "stage completed");
            }

            self.context.merge(&out.context_updates);
            if out.outcome == OutcomeKind::Fail {
                capture_failure_feedback(&mut self.context, &node, &node_dir, &out);
            }
            self.context
                .set("outcome", serde_json::json!(out.outcome.as_str()));

            let context_delta = self.context.delta(&context_before);
            self.trace.append(&TraceRecord::NodeOutputCaptured {
                node_id: node.id.clone(),
                outcome: out.outcome.as_str().to_string(),
                failure_reason: out.failure_reason.clone(),
                context_updates: serde_json::to_value(&out.context_updates)?,
                context_after: self.context.clone(),
                context_delta,
                status_path: format!("{}/status.json", node.id),
            })?;

            self.completed.insert(node.id.clone());
            self.write_checkpoint(&node.id)?;

            if self.stop_after_node.as_deref() == Some(node.id.as_str()) {
                return Err(ConveyorError::Other("test_stop".into()));
            }
            if node.is_exit() {
                return Ok(());
            }

            let next = select_next(&self.graph, &node.id, out.outcome).map(|e| e.to.clone());
            self.trace.append(&TraceRecord::RouteEvaluated {
                from_node: node.id.clone(),
                outcome: out.outcome.as_str().to_string(),
                next_node: next.clone(),
                candidates: route_candidates(&self.graph, &node.id, out.outcome),
            })?;
            tracing::info!(
                from_node = %node.id,
                outcome = out.outcome.as_str(),
                next_node = next.as_deref().unwrap_or(""),
                "route selected"
            );
            match next {
                Some(next) => current = next,
                None => {
                    return Err(ConveyorError::NoRoute {
                        node: node.id.clone(),
                        outcome: out.outcome.as_str().to_string(),
                    })
                }
            }
        }
    }

    /// One node visit, including its retry attempts. Every attempt gets its
    /// own snapshot pair and diff; the final attempt's diff is what
    /// persists.
    async fn execute_node(&mut self, node: &PipelineNode, node_dir: &Path) -> Result<Outcome> {
        if let Some(reason) = unfixable_failure_source(&self.graph, &self.context, node) {
            return Err(ConveyorError::Other(reason));
        }
        let attempts = node.max_retries + 1;
        for attempt in 0..attempts {
            tracing::debug!(node = %node.id, attempt = attempt + 1, max_attempts = attempts, "node attempt");
            let before = workspace::snapshot(&self.workspace)?;
            let mut out = self.run_handler(node, node_dir).await?;
            if out.schema_version == 0 {
                out.schema_version = 1;
            }

            if node.attr_bool("requires_tool_success", false)
                && out.outcome == OutcomeKind::Success
            {
                if let Some(req) = node.attr_str("required_tool_node") {
                    let tool_ok = read_json::<Outcome>(
                        &self.run_dir.join(&req).join("status.json"),
                    )
                    .map(|s| s.outcome == OutcomeKind::Success)
                    .unwrap_or(false);
                    if !tool_ok {
                        out.outcome = OutcomeKind::Fail;
                        out.failure_reason =
                            format!("required tool node not successful: {}", req);
                    }
                }
            }

            let after = workspace::snapshot(&self.workspace)?;
            let diff = workspace::diff(&before, &after);
            write_json(&node_dir.join("workspace.diff.json"), &diff)?;

            if is_executable_node(node) {
                let allowed =
                    parse_allowed_write_paths(node).map_err(ConveyorError::Validation)?;
                if !allowed.is_empty() {
                    let violations = workspace::disallowed_paths(&diff, &allowed);
                    if !violations.is_empty() {
                        out.outcome = OutcomeKind::Fail;
                        out.failure_reason = format!(
                            "guardrail_violation: wrote disallowed files: {}",
                            violations.join(",")
                        );
                        self.events.append(&Event::GuardrailViolation {
                            node_id: node.id.clone(),
                            paths: violations,
                        })?;
                    }
                }
            }

            if out.outcome == OutcomeKind::Retry && attempt < attempts - 1 {
                let count = self.retry_counts.entry(node.id.clone()).or_insert(0);
                *count += 1;
                let count = *count;
                self.context.set(
                    format!("internal.retry_count.{}", node.id),
                    serde_json::json!(count),
                );
                self.events.append(&Event::StageRetrying {
                    node_id: node.id.clone(),
                    retry_count: count,
                })?;
                tracing::warn!(node = %node.id, retry_count = count, "stage requested retry");
                tokio::time::sleep(RETRY_SLEEP).await;
                continue;
            }
            if out.outcome == OutcomeKind::Retry {
                if node.allow_partial {
                    out.outcome = OutcomeKind::PartialSuccess;
                } else {
                    out.outcome = OutcomeKind::Fail;
                    if out.failure_reason.is_empty() {
                        out.failure_reason = "retry_exhausted".into();
                    }
                }
            }
            return Ok(out);
        }
        unreachable!("attempt loop always returns")
    }

    async fn run_handler(&self, node: &PipelineNode, node_dir: &Path) -> Result<Outcome> {
        match node.kind() {
            NodeKind::Start | NodeKind::Exit => Ok(crate::handlers::execute_structural()),
            NodeKind::Tool => crate::handlers::tool::execute(node, node_dir, &self.workspace).await,
            NodeKind::Verification => {
                crate::handlers::verification::execute(
                    node,
                    &self.context,
                    node_dir,
                    &self.workspace,
                )
                .await
            }
            NodeKind::Codergen => {
                crate::handlers::codergen::execute(
                    node,
                    &self.context,
                    &self.graph,
                    node_dir,
                    &self.workspace,
                    &self.backend,
                )
                .await
            }
        }
    }

    fn write_checkpoint(&self, last: &str) -> Result<()> {
        let cp = Checkpoint {
            schema_version: 1,
            run_id: self.run_id.clone(),
            last_completed_node: last.to_string(),
            completed_nodes: self.completed.iter().cloned().collect(),
            retry_counts: self.retry_counts.clone(),
            context: self.context.clone(),
        };
        save_checkpoint(&self.run_dir.join("checkpoint.json"), &cp)?;
        self.events.append(&Event::CheckpointSaved {
            last_completed_node: last.to_string(),
        })?;
        Ok(())
    }
}
