//! In-memory pipeline graph built from the parsed DOT AST.

use std::collections::HashMap;
use std::time::Duration;

use conveyor_dot::{AttributeValue, DotGraph, EdgeDef, NodeDef};

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    pub goal: String,
    pub attrs: HashMap<String, AttributeValue>,
    nodes: HashMap<String, PipelineNode>,
    edges: Vec<PipelineEdge>,
    /// Maps node_id to a range (start, count) into the sorted `edges` vec.
    /// Edges are sorted by `from` so each node's outgoing edges are contiguous.
    adjacency: HashMap<String, (usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub max_retries: u64,
    pub allow_partial: bool,
    pub timeout: Option<Duration>,
    pub raw_attrs: HashMap<String, AttributeValue>,
}

#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub weight: i64,
    pub raw_attrs: HashMap<String, AttributeValue>,
}

/// The closed set of node kinds the engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    Exit,
    Tool,
    Verification,
    Codergen,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Exit => "exit",
            NodeKind::Tool => "tool",
            NodeKind::Verification => "verification",
            NodeKind::Codergen => "codergen",
        }
    }
}

// --- Attribute extraction helpers ---

fn get_string_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    attrs.get(key).map(|v| v.as_string())
}

fn get_bool_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Boolean(b) => Some(*b),
        AttributeValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn get_int_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Integer(i) => Some(*i),
        AttributeValue::Float(f) => Some(*f as i64),
        AttributeValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn get_duration_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<Duration> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Duration(d) => Some(*d),
        _ => None,
    })
}

// --- Conversions ---

fn node_def_to_pipeline_node(id: &str, node_def: &NodeDef) -> PipelineNode {
    let attrs = &node_def.attrs;
    let shape = get_string_attr(attrs, "shape").unwrap_or_else(|| "box".to_string());
    let label = get_string_attr(attrs, "label").unwrap_or_else(|| id.to_string());
    let node_type = get_string_attr(attrs, "type");
    let prompt = get_string_attr(attrs, "prompt");
    let max_retries = get_int_attr(attrs, "max_retries")
        .map(|v| v.max(0) as u64)
        .unwrap_or(0);
    let allow_partial = get_bool_attr(attrs, "allow_partial").unwrap_or(false);
    let timeout = get_duration_attr(attrs, "timeout");

    PipelineNode {
        id: id.to_string(),
        label,
        shape,
        node_type,
        prompt,
        max_retries,
        allow_partial,
        timeout,
        raw_attrs: attrs.clone(),
    }
}

fn edge_def_to_pipeline_edge(edge_def: &EdgeDef) -> PipelineEdge {
    let attrs = &edge_def.attrs;
    PipelineEdge {
        from: edge_def.from.clone(),
        to: edge_def.to.clone(),
        label: get_string_attr(attrs, "label"),
        condition: get_string_attr(attrs, "condition")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
        weight: get_int_attr(attrs, "weight").unwrap_or(0),
        raw_attrs: attrs.clone(),
    }
}

impl PipelineNode {
    /// String attribute with the usual scalar coercions; `None` when absent.
    pub fn attr_str(&self, key: &str) -> Option<String> {
        get_string_attr(&self.raw_attrs, key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn attr_bool(&self, key: &str, default: bool) -> bool {
        get_bool_attr(&self.raw_attrs, key).unwrap_or(default)
    }

    pub fn attr_int(&self, key: &str, default: i64) -> i64 {
        get_int_attr(&self.raw_attrs, key).unwrap_or(default)
    }

    pub fn is_start(&self) -> bool {
        self.shape == "Mdiamond" || self.id == "start"
    }

    pub fn is_exit(&self) -> bool {
        self.shape == "Msquare" || self.id == "exit" || self.id == "end"
    }

    /// Handler kind: structural start/exit first, then the explicit `type`
    /// attribute, then shape, defaulting to codergen.
    pub fn kind(&self) -> NodeKind {
        if self.is_start() {
            return NodeKind::Start;
        }
        if self.is_exit() {
            return NodeKind::Exit;
        }
        if let Some(t) = self.node_type.as_deref() {
            match t {
                "start" => return NodeKind::Start,
                "exit" => return NodeKind::Exit,
                "tool" => return NodeKind::Tool,
                "verification" => return NodeKind::Verification,
                "codergen" => return NodeKind::Codergen,
                _ => {}
            }
        }
        match self.shape.as_str() {
            "parallelogram" => NodeKind::Tool,
            _ => NodeKind::Codergen,
        }
    }
}

impl PipelineGraph {
    pub fn from_dot(graph: DotGraph) -> Self {
        let mut nodes = HashMap::new();
        for (id, node_def) in &graph.nodes {
            nodes.insert(id.clone(), node_def_to_pipeline_node(id, node_def));
        }

        let mut all_edges: Vec<PipelineEdge> =
            graph.edges.iter().map(edge_def_to_pipeline_edge).collect();

        // Sort edges by `from` so each node's outgoing edges form a
        // contiguous slice; the sort is stable, so declaration order is
        // preserved within a node.
        all_edges.sort_by(|a, b| a.from.cmp(&b.from));

        let mut adjacency: HashMap<String, (usize, usize)> = HashMap::new();
        let mut i = 0;
        while i < all_edges.len() {
            let start = i;
            let from = &all_edges[i].from;
            while i < all_edges.len() && all_edges[i].from == *from {
                i += 1;
            }
            adjacency.insert(from.clone(), (start, i - start));
        }

        let goal = get_string_attr(&graph.attrs, "goal").unwrap_or_default();

        PipelineGraph {
            name: graph.name,
            goal,
            attrs: graph.attrs,
            nodes,
            edges: all_edges,
            adjacency,
        }
    }

    /// The unique start node: shape `Mdiamond` or id `start`.
    pub fn start_node(&self) -> Option<&PipelineNode> {
        self.nodes
            .values()
            .find(|n| n.shape == "Mdiamond")
            .or_else(|| self.nodes.get("start"))
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[PipelineEdge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }
}
