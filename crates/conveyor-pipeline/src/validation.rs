//! Static pipeline validation: rules and diagnostics.
//!
//! Call [`validate`] for the full diagnostic list or [`validate_or_raise`]
//! to fail when any `Error`-severity issue is present. Diagnostics are
//! sorted by message text so the output is deterministic regardless of
//! declaration order.

use std::collections::{HashSet, VecDeque};

use crate::graph::PipelineGraph;
use crate::guardrail::parse_allowed_write_paths;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

fn error(rule: &str, message: String) -> Diagnostic {
    Diagnostic {
        rule: rule.into(),
        severity: Severity::Error,
        message,
        node_id: None,
        edge: None,
    }
}

// ---------------------------------------------------------------------------
// Rule trait
// ---------------------------------------------------------------------------

pub trait Rule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct StartNodeRule;
impl Rule for StartNodeRule {
    fn name(&self) -> &str {
        "start_node"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph.all_nodes().filter(|n| n.is_start()).collect();
        if starts.len() != 1 {
            vec![error(
                self.name(),
                "must have exactly one start node".into(),
            )]
        } else {
            vec![]
        }
    }
}

struct ExitNodeRule;
impl Rule for ExitNodeRule {
    fn name(&self) -> &str {
        "exit_node"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if graph.all_nodes().any(|n| n.is_exit()) {
            vec![]
        } else {
            vec![error(self.name(), "must have at least one exit node".into())]
        }
    }
}

struct StartNoIncomingRule;
impl Rule for StartNoIncomingRule {
    fn name(&self) -> &str {
        "start_no_incoming"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let start = match graph.start_node() {
            Some(n) => n.id.clone(),
            None => return vec![],
        };
        if graph.all_edges().iter().any(|e| e.to == start) {
            vec![error(
                self.name(),
                "start node cannot have incoming edges".into(),
            )]
        } else {
            vec![]
        }
    }
}

struct ExitNoOutgoingRule;
impl Rule for ExitNoOutgoingRule {
    fn name(&self) -> &str {
        "exit_no_outgoing"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.is_exit())
            .filter(|n| !graph.outgoing_edges(&n.id).is_empty())
            .map(|n| {
                let mut d = error(
                    self.name(),
                    format!("exit node has outgoing edges: {}", n.id),
                );
                d.node_id = Some(n.id.clone());
                d
            })
            .collect()
    }
}

struct EdgeTargetExistsRule;
impl Rule for EdgeTargetExistsRule {
    fn name(&self) -> &str {
        "edge_target_exists"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter(|e| graph.node(&e.to).is_none())
            .map(|e| {
                let mut d = error(self.name(), format!("edge target missing: {}", e.to));
                d.edge = Some((e.from.clone(), e.to.clone()));
                d
            })
            .collect()
    }
}

struct ReachabilityRule;
impl Rule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let start_id = match graph.start_node() {
            Some(n) => n.id.clone(),
            None => return vec![], // StartNodeRule reports this
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start_id.clone());
        queue.push_back(start_id);
        while let Some(current) = queue.pop_front() {
            for edge in graph.outgoing_edges(&current) {
                if visited.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }

        graph
            .all_nodes()
            .filter(|n| !visited.contains(&n.id))
            .map(|n| {
                let mut d = error(self.name(), format!("unreachable node: {}", n.id));
                d.node_id = Some(n.id.clone());
                d
            })
            .collect()
    }
}

/// The condition language is the closed `outcome=<tag>` set; anything else
/// on an edge is an error.
struct ConditionRule;
impl Rule for ConditionRule {
    fn name(&self) -> &str {
        "condition"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        const ALLOWED: [&str; 4] = [
            "outcome=success",
            "outcome=fail",
            "outcome=retry",
            "outcome=partial_success",
        ];
        graph
            .all_edges()
            .iter()
            .filter_map(|e| {
                let cond = e.condition.as_deref()?;
                if ALLOWED.contains(&cond) {
                    None
                } else {
                    let mut d = error(self.name(), format!("unsupported condition: {}", cond));
                    d.edge = Some((e.from.clone(), e.to.clone()));
                    Some(d)
                }
            })
            .collect()
    }
}

/// Shapes and type tags belonging to handlers this engine does not ship.
struct SupportedHandlerRule;
impl Rule for SupportedHandlerRule {
    fn name(&self) -> &str {
        "supported_handler"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        const REJECTED_PAIRS: [(&str, &str); 5] = [
            ("hexagon", "wait.human"),
            ("diamond", "conditional"),
            ("component", "parallel"),
            ("tripleoctagon", "parallel.fan_in"),
            ("house", "stack.manager_loop"),
        ];
        const SUPPORTED_SHAPES: [&str; 4] = ["Mdiamond", "Msquare", "box", "parallelogram"];
        const SUPPORTED_TYPES: [&str; 5] = ["start", "exit", "codergen", "tool", "verification"];

        let mut diags = Vec::new();
        for node in graph.all_nodes() {
            let shape = node.shape.as_str();
            let typ = node.node_type.as_deref().unwrap_or("");
            if REJECTED_PAIRS
                .iter()
                .any(|(s, t)| shape == *s || typ == *t)
            {
                let mut d = error(
                    self.name(),
                    format!("unsupported handler: shape={} type={}", shape, typ),
                );
                d.node_id = Some(node.id.clone());
                diags.push(d);
                continue;
            }
            if !SUPPORTED_SHAPES.contains(&shape) {
                let mut d = error(self.name(), format!("unsupported shape: {}", shape));
                d.node_id = Some(node.id.clone());
                diags.push(d);
            }
            if !typ.is_empty() && !SUPPORTED_TYPES.contains(&typ) {
                let mut d = error(self.name(), format!("unsupported type: {}", typ));
                d.node_id = Some(node.id.clone());
                diags.push(d);
            }
        }
        diags
    }
}

struct AllowedWritePathsRule;
impl Rule for AllowedWritePathsRule {
    fn name(&self) -> &str {
        "allowed_write_paths"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter_map(|n| match parse_allowed_write_paths(n) {
                Ok(_) => None,
                Err(msg) => {
                    let mut d = error(self.name(), msg);
                    d.node_id = Some(n.id.clone());
                    Some(d)
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run every rule and return the diagnostics sorted by message.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn Rule>> = vec![
        Box::new(StartNodeRule),
        Box::new(ExitNodeRule),
        Box::new(StartNoIncomingRule),
        Box::new(ExitNoOutgoingRule),
        Box::new(EdgeTargetExistsRule),
        Box::new(ReachabilityRule),
        Box::new(ConditionRule),
        Box::new(SupportedHandlerRule),
        Box::new(AllowedWritePathsRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics.sort_by(|a, b| a.message.cmp(&b.message));
    diagnostics
}

/// Run all rules; return `Err` when any `Error`-severity diagnostic exists.
pub fn validate_or_raise(graph: &PipelineGraph) -> conveyor_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(conveyor_types::ConveyorError::Validation(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
