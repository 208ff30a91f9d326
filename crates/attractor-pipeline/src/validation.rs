//! Advisory lint pass over a parsed [`Graph`].
//!
//! `Graph::from_dot` already hard-fails on the structural invariants (one
//! start node, at least one exit node, every non-exit node has an outgoing
//! edge) — anything that reaches this module is already structurally sound.
//! These rules catch the softer mistakes that still compile: nodes nothing
//! can reach, malformed condition strings, retry targets that don't exist,
//! goal gates with no way back, and codegen nodes carrying no prompt.

use std::collections::{HashSet, VecDeque};

use crate::condition::parse_condition;
use crate::graph::Graph;

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }

    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_node() else { return vec![] };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.id.clone());
        queue.push_back(start.id.clone());

        while let Some(current) = queue.pop_front() {
            for edge in graph.outgoing_edges(&current) {
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }

        graph
            .nodes()
            .filter(|n| !visited.contains(&n.id))
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("node '{}' is not reachable from the start node", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("add an edge leading to '{}' or remove it", n.id)),
            })
            .collect()
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str {
        "condition_syntax"
    }

    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .edges()
            .iter()
            .filter_map(|e| {
                if e.condition.trim().is_empty() {
                    return None;
                }
                let cond = e.condition.as_str();
                match parse_condition(cond) {
                    Ok(_) => None,
                    Err(err) => Some(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!("edge {} -> {} has invalid condition '{cond}': {err}", e.source, e.target),
                        node_id: None,
                        edge: Some((e.source.clone(), e.target.clone())),
                        fix: Some("fix the condition expression syntax".into()),
                    }),
                }
            })
            .collect()
    }
}

struct RetryTargetExistsRule;
impl LintRule for RetryTargetExistsRule {
    fn name(&self) -> &str {
        "retry_target_exists"
    }

    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter_map(|n| n.retry_target().map(|target| (n, target)))
            .filter(|(_, target)| graph.node(target).is_none())
            .map(|(n, target)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("node '{}' has retry_target '{target}' which does not exist", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("add node '{target}' or fix retry_target")),
            })
            .collect()
    }
}

struct GoalGateHasRetryRule;
impl LintRule for GoalGateHasRetryRule {
    fn name(&self) -> &str {
        "goal_gate_has_retry"
    }

    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter(|n| n.goal_gate() && n.retry_target().is_none())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("node '{}' has goal_gate=true but no retry_target", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some("add a retry_target attribute, or route failure via an edge condition".into()),
            })
            .collect()
    }
}

/// Nodes dispatched to an external worker (`codegen`, `tool`) that carry
/// neither a `prompt` nor a descriptive label — likely placeholders.
struct PromptOnWorkerNodesRule;
impl LintRule for PromptOnWorkerNodesRule {
    fn name(&self) -> &str {
        "prompt_on_worker_nodes"
    }

    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter(|n| matches!(n.shape.as_str(), "codegen" | "tool"))
            .filter(|n| n.prompt().is_none() && n.label.as_deref().map(|l| l == n.id).unwrap_or(true))
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("node '{}' (shape={}) has no prompt and no descriptive label", n.id, n.shape),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some("add a prompt or a descriptive label attribute".into()),
            })
            .collect()
    }
}

pub fn validate(graph: &Graph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(ReachabilityRule),
        Box::new(ConditionSyntaxRule),
        Box::new(RetryTargetExistsRule),
        Box::new(GoalGateHasRetryRule),
        Box::new(PromptOnWorkerNodesRule),
    ];
    rules.iter().flat_map(|r| r.apply(graph)).collect()
}

/// Run all lint rules, failing on the first `Error`-severity diagnostic.
pub fn validate_or_raise(graph: &Graph) -> attractor_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<&Diagnostic> = diagnostics.iter().filter(|d| d.severity == Severity::Error).collect();
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(attractor_types::EngineError::Validation(messages.join("; ")));
    }
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(dot: &str) -> Graph {
        Graph::from_dot(attractor_dot::parse(dot).unwrap()).unwrap()
    }

    #[test]
    fn valid_pipeline_has_no_errors() {
        let g = parse(
            r#"digraph G {
                start [shape="Mdiamond"]
                process [shape="box", prompt="do the thing"]
                done [shape="Msquare"]
                start -> process -> done
            }"#,
        );
        let diags = validate(&g);
        assert!(diags.iter().all(|d| d.severity != Severity::Error), "{diags:?}");
    }

    #[test]
    fn unreachable_node_is_flagged() {
        let g = parse(
            r#"digraph G {
                start [shape="Mdiamond"]
                process [shape="box", prompt="x"]
                orphan [shape="box", prompt="x"]
                done [shape="Msquare"]
                start -> process -> done
                orphan -> done
            }"#,
        );
        let diags = validate(&g);
        assert!(diags.iter().any(|d| d.rule == "reachability" && d.node_id.as_deref() == Some("orphan")));
    }

    #[test]
    fn invalid_condition_syntax_is_an_error() {
        let g = parse(
            r#"digraph G {
                start [shape="Mdiamond"]
                a [shape="box", prompt="x"]
                done [shape="Msquare"]
                start -> a [condition="no_operator_here"]
                a -> done
            }"#,
        );
        let diags = validate(&g);
        assert!(diags.iter().any(|d| d.rule == "condition_syntax" && d.severity == Severity::Error));
    }

    #[test]
    fn goal_gate_without_retry_target_is_a_warning() {
        let g = parse(
            r#"digraph G {
                start [shape="Mdiamond"]
                gate [shape="box", goal_gate=true, prompt="x"]
                done [shape="Msquare"]
                start -> gate -> done
            }"#,
        );
        let diags = validate(&g);
        assert!(diags.iter().any(|d| d.rule == "goal_gate_has_retry" && d.severity == Severity::Warning));
    }

    #[test]
    fn retry_target_pointing_nowhere_is_a_warning() {
        let g = parse(
            r#"digraph G {
                start [shape="Mdiamond"]
                gate [shape="box", retry_target="ghost", prompt="x"]
                done [shape="Msquare"]
                start -> gate -> done
            }"#,
        );
        let diags = validate(&g);
        assert!(diags.iter().any(|d| d.rule == "retry_target_exists" && d.severity == Severity::Warning));
    }

    #[test]
    fn worker_node_without_prompt_or_label_is_a_warning() {
        let g = parse(
            r#"digraph G {
                start [shape="Mdiamond"]
                work [shape="box"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        let diags = validate(&g);
        assert!(diags.iter().any(|d| d.rule == "prompt_on_worker_nodes"));
    }

    #[test]
    fn validate_or_raise_errors_on_unreachable_node() {
        let g = parse(
            r#"digraph G {
                start [shape="Mdiamond"]
                orphan [shape="box", prompt="x"]
                done [shape="Msquare"]
                start -> done
                orphan -> done
            }"#,
        );
        assert!(validate_or_raise(&g).is_err());
    }
}
