//! Deterministic routing between stages.
//!
//! After a stage completes, its outgoing edges are partitioned into
//! conditionals matching `outcome=<tag>` and unconditionals. Matching
//! conditionals win; otherwise the unconditional set is used. Within the
//! candidate set, highest weight wins and ties break on the lexically
//! smallest target id. Routing is a pure function of (edges, outcome).

use serde::Serialize;

use conveyor_types::OutcomeKind;

use crate::graph::{PipelineEdge, PipelineGraph};

/// Pick the next edge out of `from` for the given outcome. `None` means no
/// route exists (terminal for exit nodes, an error otherwise).
pub fn select_next<'a>(
    graph: &'a PipelineGraph,
    from: &str,
    outcome: OutcomeKind,
) -> Option<&'a PipelineEdge> {
    let edges = graph.outgoing_edges(from);
    if edges.is_empty() {
        return None;
    }

    let wanted = format!("outcome={}", outcome.as_str());
    let conditionals: Vec<&PipelineEdge> = edges
        .iter()
        .filter(|e| e.condition.as_deref() == Some(wanted.as_str()))
        .collect();
    let candidates = if conditionals.is_empty() {
        edges.iter().filter(|e| e.condition.is_none()).collect()
    } else {
        conditionals
    };
    best_by_weight_then_lexical(candidates)
}

fn best_by_weight_then_lexical(edges: Vec<&PipelineEdge>) -> Option<&PipelineEdge> {
    edges.into_iter().max_by(|a, b| {
        a.weight
            .cmp(&b.weight)
            // lexical ascending target wins ties = reverse compare on `to`
            .then_with(|| b.to.cmp(&a.to))
    })
}

/// Audit view of every outgoing edge for the trace log, sorted by
/// (target, condition).
#[derive(Debug, Clone, Serialize)]
pub struct RouteCandidate {
    pub to: String,
    pub weight: i64,
    pub condition: String,
    pub matched: bool,
}

pub fn route_candidates(
    graph: &PipelineGraph,
    from: &str,
    outcome: OutcomeKind,
) -> Vec<RouteCandidate> {
    let wanted = format!("outcome={}", outcome.as_str());
    let mut out: Vec<RouteCandidate> = graph
        .outgoing_edges(from)
        .iter()
        .map(|e| {
            let condition = e.condition.clone().unwrap_or_default();
            let matched = condition.is_empty() || condition == wanted;
            RouteCandidate {
                to: e.to.clone(),
                weight: e.weight,
                condition,
                matched,
            }
        })
        .collect();
    out.sort_by(|a, b| a.to.cmp(&b.to).then_with(|| a.condition.cmp(&b.condition)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_and_build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(conveyor_dot::parse(dot).unwrap())
    }

    #[test]
    fn matching_conditional_beats_unconditional() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> B [condition="outcome=success"]
            A -> C
        }"#,
        );
        let edge = select_next(&pg, "A", OutcomeKind::Success).unwrap();
        assert_eq!(edge.to, "B");
    }

    #[test]
    fn non_matching_conditional_is_discarded() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> B [condition="outcome=fail"]
            A -> C
        }"#,
        );
        let edge = select_next(&pg, "A", OutcomeKind::Success).unwrap();
        assert_eq!(edge.to, "C");
    }

    #[test]
    fn no_match_and_no_unconditional_routes_nowhere() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> B [condition="outcome=fail"]
        }"#,
        );
        assert!(select_next(&pg, "A", OutcomeKind::Success).is_none());
    }

    #[test]
    fn highest_weight_wins() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> B [weight=2]
            A -> C [weight=1]
        }"#,
        );
        assert_eq!(select_next(&pg, "A", OutcomeKind::Success).unwrap().to, "B");
    }

    #[test]
    fn lexical_tiebreak_on_equal_weight() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> C [weight=1]
            A -> B [weight=1]
        }"#,
        );
        assert_eq!(select_next(&pg, "A", OutcomeKind::Success).unwrap().to, "B");
    }

    #[test]
    fn weight_applies_within_conditional_set() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> B [condition="outcome=fail", weight=1]
            A -> C [condition="outcome=fail", weight=9]
            A -> D
        }"#,
        );
        assert_eq!(select_next(&pg, "A", OutcomeKind::Fail).unwrap().to, "C");
    }

    #[test]
    fn no_edges_returns_none() {
        let pg = parse_and_build(r#"digraph G { A [label="terminal"] }"#);
        assert!(select_next(&pg, "A", OutcomeKind::Success).is_none());
    }

    #[test]
    fn routing_is_deterministic() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> B [weight=3]
            A -> C [weight=3]
            A -> D [condition="outcome=retry"]
        }"#,
        );
        let first = select_next(&pg, "A", OutcomeKind::Success).unwrap().to.clone();
        for _ in 0..10 {
            assert_eq!(select_next(&pg, "A", OutcomeKind::Success).unwrap().to, first);
        }
        assert_eq!(first, "B");
    }

    #[test]
    fn candidates_record_matched_flags() {
        let pg = parse_and_build(
            r#"digraph G {
            A -> B [condition="outcome=fail"]
            A -> C
        }"#,
        );
        let candidates = route_candidates(&pg, "A", OutcomeKind::Success);
        assert_eq!(candidates.len(), 2);
        let b = candidates.iter().find(|c| c.to == "B").unwrap();
        let c = candidates.iter().find(|c| c.to == "C").unwrap();
        assert!(!b.matched);
        assert!(c.matched);
    }
}
