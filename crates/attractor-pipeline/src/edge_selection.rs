//! Five-step deterministic edge selection.
//!
//! After a node completes, [`select_edge`] determines which outgoing edge to
//! follow next. The five steps run in strict priority order; the first step
//! that yields a result wins.

use crate::condition::ConditionEvaluator;
use crate::graph::{Edge, Graph};
use attractor_types::{EngineError, Outcome, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Select the next edge out of `node_id` given the handler's `outcome` and a
/// `context` snapshot (not the live context — see the crate-level docs on
/// why routing decisions must be immune to concurrent mutation).
pub fn select_edge<'g>(
    graph: &'g Graph,
    node_id: &str,
    outcome: &Outcome,
    context: &HashMap<String, Value>,
    evaluator: &dyn ConditionEvaluator,
) -> Result<&'g Edge> {
    let edges = graph.outgoing_edges(node_id);
    if edges.is_empty() {
        return Err(EngineError::NoEdge {
            node_id: node_id.to_string(),
            available_edges: Vec::new(),
        });
    }

    // Step 1: first edge (in declaration order) whose non-empty condition
    // evaluates true.
    for edge in &edges {
        if edge.has_condition() && evaluator.evaluate(&edge.condition, context, outcome) {
            return Ok(find_same(graph, node_id, edge));
        }
    }

    // Step 2: preferred label.
    if let Some(label) = &outcome.preferred_label {
        if let Some(edge) = edges.iter().find(|e| e.label.as_deref() == Some(label.as_str())) {
            return Ok(find_same(graph, node_id, edge));
        }
    }

    // Step 3: suggested next target.
    if let Some(target) = &outcome.suggested_next {
        if let Some(edge) = edges.iter().find(|e| &e.target == target) {
            return Ok(find_same(graph, node_id, edge));
        }
    }

    // Step 4: highest weight; ties broken by declaration order (first edge
    // reaching the maximum wins).
    let mut best: Option<&Edge> = None;
    for edge in &edges {
        if let Some(w) = edge.weight {
            let better = match best {
                None => true,
                Some(b) => w > b.weight.unwrap_or(f64::MIN),
            };
            if better {
                best = Some(edge);
            }
        }
    }
    if let Some(edge) = best {
        return Ok(find_same(graph, node_id, edge));
    }

    // Step 5: default — first edge with neither label nor condition; else
    // the first outgoing edge.
    if let Some(edge) = edges.iter().find(|e| e.label.is_none() && !e.has_condition()) {
        return Ok(find_same(graph, node_id, edge));
    }
    Ok(find_same(graph, node_id, edges[0]))
}

/// `graph.outgoing_edges` returns owned `&Edge` borrows already tied to
/// `graph`'s lifetime; this just re-asserts that lifetime at the return
/// site so callers get `'g` rather than a borrow scoped to the local `Vec`.
fn find_same<'g>(graph: &'g Graph, node_id: &str, edge: &Edge) -> &'g Edge {
    graph
        .outgoing_edges(node_id)
        .into_iter()
        .find(|e| e.id() == edge.id())
        .expect("edge came from this node's outgoing edge list")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::StubConditionEvaluator;
    use attractor_types::OutcomeStatus;

    fn graph_from(dot: &str) -> Graph {
        Graph::from_dot(attractor_dot::parse(dot).unwrap()).unwrap()
    }

    fn bare_outcome(status: OutcomeStatus) -> Outcome {
        match status {
            OutcomeStatus::Success => Outcome::success(),
            OutcomeStatus::Failure => Outcome::failure(),
            OutcomeStatus::PartialSuccess => Outcome::partial_success(),
            OutcomeStatus::Waiting => Outcome::waiting(),
            OutcomeStatus::Skipped => Outcome::skipped(),
        }
    }

    #[test]
    fn no_outgoing_edges_errors() {
        let g = graph_from(
            r#"digraph P { start [shape="Mdiamond"] done [shape="Msquare"] start -> done }"#,
        );
        let ctx = HashMap::new();
        let err = select_edge(&g, "done", &bare_outcome(OutcomeStatus::Success), &ctx, &StubConditionEvaluator)
            .unwrap_err();
        assert!(matches!(err, EngineError::NoEdge { .. }));
    }

    #[test]
    fn step1_condition_wins_over_everything_else() {
        let g = graph_from(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"] b [shape="box"] c [shape="box"] d [shape="box"]
                start -> a [condition="true"]
                start -> b [label="pass"]
                start -> c [weight=99]
                start -> d
                a -> d b -> d c -> d
            }"#,
        );
        let ctx = HashMap::new();
        let outcome = Outcome::success().with_preferred_label("pass");
        let edge = select_edge(&g, "start", &outcome, &ctx, &StubConditionEvaluator).unwrap();
        assert_eq!(edge.target, "a");
    }

    #[test]
    fn step2_preferred_label() {
        let g = graph_from(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"] b [shape="box"]
                start -> a [label="reject"]
                start -> b [label="approve"]
                a -> b
            }"#,
        );
        let ctx = HashMap::new();
        let outcome = Outcome::success().with_preferred_label("approve");
        let edge = select_edge(&g, "start", &outcome, &ctx, &StubConditionEvaluator).unwrap();
        assert_eq!(edge.target, "b");
    }

    #[test]
    fn step3_suggested_next() {
        let g = graph_from(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"] b [shape="box"]
                start -> a
                start -> b
                a -> b
            }"#,
        );
        let ctx = HashMap::new();
        let outcome = Outcome::success().with_suggested_next("b");
        let edge = select_edge(&g, "start", &outcome, &ctx, &StubConditionEvaluator).unwrap();
        assert_eq!(edge.target, "b");
    }

    #[test]
    fn step4_weight_ties_broken_by_declaration_order() {
        let g = graph_from(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"] b [shape="box"] c [shape="Msquare"]
                start -> a [weight=5]
                start -> b [weight=5]
                a -> c b -> c
            }"#,
        );
        let ctx = HashMap::new();
        let edge = select_edge(&g, "start", &bare_outcome(OutcomeStatus::Success), &ctx, &StubConditionEvaluator)
            .unwrap();
        assert_eq!(edge.target, "a");
    }

    #[test]
    fn step5_default_prefers_unlabeled_uncondiitoned_edge() {
        let g = graph_from(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"] b [shape="box"]
                start -> a [label="maybe"]
                start -> b
                a -> b
            }"#,
        );
        let ctx = HashMap::new();
        let edge = select_edge(&g, "start", &bare_outcome(OutcomeStatus::Success), &ctx, &StubConditionEvaluator)
            .unwrap();
        assert_eq!(edge.target, "b");
    }

    #[test]
    fn step5_falls_back_to_first_edge_when_all_have_labels() {
        let g = graph_from(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"] b [shape="box"]
                start -> a [label="x"]
                start -> b [label="y"]
                a -> b
            }"#,
        );
        let ctx = HashMap::new();
        let edge = select_edge(&g, "start", &bare_outcome(OutcomeStatus::Success), &ctx, &StubConditionEvaluator)
            .unwrap();
        assert_eq!(edge.target, "a");
    }

    #[test]
    fn selection_is_deterministic_across_repeated_calls() {
        let g = graph_from(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"] b [shape="box"]
                start -> a [weight=1]
                start -> b [weight=2]
                a -> b
            }"#,
        );
        let ctx = HashMap::new();
        let o = bare_outcome(OutcomeStatus::Success);
        let e1 = select_edge(&g, "start", &o, &ctx, &StubConditionEvaluator).unwrap();
        let e2 = select_edge(&g, "start", &o, &ctx, &StubConditionEvaluator).unwrap();
        assert_eq!(e1.id(), e2.id());
        assert_eq!(e1.target, "b");
    }
}
