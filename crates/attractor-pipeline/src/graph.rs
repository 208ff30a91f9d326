//! Graph data model: [`Node`], [`Edge`], [`Graph`], and the DOT→Graph lowering.
//!
//! A `Graph` is built once from a parsed `attractor_dot::DotGraph` and is
//! immutable afterwards; the runner and handlers only ever read it.

use attractor_dot::{AttributeValue, DotGraph};
use attractor_types::{EngineError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Maps a DOT `shape` attribute to the engine's semantic shape name. Any
/// shape not in this table passes through unchanged, which is what lets
/// `HandlerRegistry::dispatch` raise `UnknownShape` for it rather than this
/// function.
fn dot_shape_to_semantic(dot_shape: &str) -> &str {
    match dot_shape {
        "Mdiamond" => "start",
        "Msquare" => "exit",
        "box" => "codegen",
        "diamond" => "conditional",
        "hexagon" => "human-wait",
        "component" => "parallel",
        "tripleoctagon" => "fan-in",
        "parallelogram" => "tool",
        "house" => "manager-loop",
        other => other,
    }
}

fn attr_value_to_json(v: &AttributeValue) -> Value {
    match v {
        AttributeValue::String(s) => Value::String(s.clone()),
        AttributeValue::Integer(i) => Value::from(*i),
        AttributeValue::Float(f) => {
            serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
        }
        AttributeValue::Boolean(b) => Value::Bool(*b),
        AttributeValue::Duration(d) => Value::from(d.as_secs_f64()),
    }
}

fn attrs_to_json_map(attrs: &HashMap<String, AttributeValue>) -> HashMap<String, Value> {
    attrs.iter().map(|(k, v)| (k.clone(), attr_value_to_json(v))).collect()
}

fn json_as_str(v: &Value) -> Option<&str> {
    v.as_str()
}

fn json_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

/// Dispatch strategy for a `codegen` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    Tmux,
    Sdk,
    Inline,
}

impl Default for DispatchStrategy {
    fn default() -> Self {
        DispatchStrategy::Tmux
    }
}

/// Join policy for a `parallel` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    WaitAll,
    FirstSuccess,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        JoinPolicy::WaitAll
    }
}

/// A pipeline node. Read-only after construction; typed accessors read
/// through to the free-form `attrs` bag.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub shape: String,
    pub label: Option<String>,
    pub attrs: HashMap<String, Value>,
}

impl Node {
    fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    pub fn prompt(&self) -> Option<&str> {
        self.attr("prompt").and_then(json_as_str)
    }

    pub fn goal_gate(&self) -> bool {
        self.attr("goal_gate").map(json_truthy).unwrap_or(false)
    }

    pub fn tool_command(&self) -> Option<&str> {
        self.attr("tool_command").and_then(json_as_str)
    }

    pub fn dispatch_strategy(&self) -> DispatchStrategy {
        match self.attr("dispatch_strategy").and_then(json_as_str) {
            Some("sdk") => DispatchStrategy::Sdk,
            Some("inline") => DispatchStrategy::Inline,
            _ => DispatchStrategy::Tmux,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.attr("max_retries")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or(3)
    }

    pub fn retry_target(&self) -> Option<&str> {
        self.attr("retry_target").and_then(json_as_str)
    }

    pub fn join_policy(&self) -> JoinPolicy {
        match self.attr("join_policy").and_then(json_as_str) {
            Some("first_success") => JoinPolicy::FirstSuccess,
            _ => JoinPolicy::WaitAll,
        }
    }

    pub fn allow_partial(&self) -> bool {
        self.attr("allow_partial").map(json_truthy).unwrap_or(false)
    }

    pub fn worker_type(&self) -> Option<&str> {
        self.attr("worker_type").and_then(json_as_str)
    }

    pub fn acceptance(&self) -> Option<&str> {
        self.attr("acceptance").and_then(json_as_str)
    }

    pub fn file_path(&self) -> Option<&str> {
        self.attr("file_path").and_then(json_as_str)
    }

    pub fn folder_path(&self) -> Option<&str> {
        self.attr("folder_path").and_then(json_as_str)
    }

    pub fn bead_id(&self) -> Option<&str> {
        self.attr("bead_id").and_then(json_as_str)
    }

    pub fn prd_ref(&self) -> Option<&str> {
        self.attr("prd_ref").and_then(json_as_str)
    }
}

/// A pipeline edge. Stable id is `"{source}->{target}"`.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub label: Option<String>,
    /// Empty string means "no condition".
    pub condition: String,
    pub weight: Option<f64>,
    pub loop_restart: bool,
    pub attrs: HashMap<String, Value>,
}

impl Edge {
    pub fn id(&self) -> String {
        format!("{}->{}", self.source, self.target)
    }

    pub fn has_condition(&self) -> bool {
        !self.condition.trim().is_empty()
    }
}

/// Graph-level attributes.
#[derive(Debug, Clone, Default)]
pub struct GraphAttrs {
    pub prd_ref: Option<String>,
    pub promise_id: Option<String>,
    pub default_max_retry: u32,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
}

/// Immutable pipeline graph with cached adjacency. Built once via
/// [`Graph::from_dot`]; the runner and handlers only read it afterwards.
#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub attrs: GraphAttrs,
    node_order: Vec<String>,
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    /// node id -> indices into `edges`, in declaration order.
    forward: HashMap<String, Vec<usize>>,
    /// node id -> indices into `edges` targeting it, in declaration order.
    reverse: HashMap<String, Vec<usize>>,
}

impl Graph {
    pub fn from_dot(dot: DotGraph) -> Result<Self> {
        let attrs = GraphAttrs {
            prd_ref: dot.attrs.get("prd_ref").and_then(|v| match v {
                AttributeValue::String(s) => Some(s.clone()),
                _ => None,
            }),
            promise_id: dot.attrs.get("promise_id").and_then(|v| match v {
                AttributeValue::String(s) => Some(s.clone()),
                _ => None,
            }),
            default_max_retry: dot
                .attrs
                .get("default_max_retry")
                .and_then(|v| match v {
                    AttributeValue::Integer(i) => Some(*i as u32),
                    _ => None,
                })
                .unwrap_or(50),
            retry_target: dot.attrs.get("retry_target").and_then(|v| match v {
                AttributeValue::String(s) => Some(s.clone()),
                _ => None,
            }),
            fallback_retry_target: dot.attrs.get("fallback_retry_target").and_then(|v| match v {
                AttributeValue::String(s) => Some(s.clone()),
                _ => None,
            }),
        };

        // DotGraph.nodes is a HashMap; recover a stable declaration order.
        // Definition-only ids are sorted (HashMap iteration order is not
        // meaningful); edge traversal then interleaves first-reference order
        // for everything else, closely matching Graphviz's own appearance
        // order.
        let mut node_order = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut push_seen = |id: &str, order: &mut Vec<String>, seen: &mut std::collections::HashSet<String>| {
            if seen.insert(id.to_string()) {
                order.push(id.to_string());
            }
        };
        let mut defined_ids: Vec<&String> = dot.nodes.keys().collect();
        defined_ids.sort();
        for id in defined_ids {
            push_seen(id, &mut node_order, &mut seen);
        }
        for e in &dot.edges {
            push_seen(&e.from, &mut node_order, &mut seen);
            push_seen(&e.to, &mut node_order, &mut seen);
        }

        let mut nodes = HashMap::new();
        for id in &node_order {
            let raw_attrs = dot
                .nodes
                .get(id)
                .map(|n| attrs_to_json_map(&n.attrs))
                .unwrap_or_default();
            let dot_shape = raw_attrs
                .get("shape")
                .and_then(|v| v.as_str())
                .unwrap_or("box");
            let label = raw_attrs.get("label").and_then(|v| v.as_str()).map(|s| s.to_string());
            nodes.insert(
                id.clone(),
                Node {
                    id: id.clone(),
                    shape: dot_shape_to_semantic(dot_shape).to_string(),
                    label,
                    attrs: raw_attrs,
                },
            );
        }

        let mut edges = Vec::with_capacity(dot.edges.len());
        for e in &dot.edges {
            let raw_attrs = attrs_to_json_map(&e.attrs);
            let label = raw_attrs.get("label").and_then(|v| v.as_str()).map(|s| s.to_string());
            let condition = raw_attrs
                .get("condition")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let weight = raw_attrs.get("weight").and_then(|v| v.as_f64());
            let loop_restart = raw_attrs.get("loop_restart").map(json_truthy).unwrap_or(false);
            edges.push(Edge {
                source: e.from.clone(),
                target: e.to.clone(),
                label,
                condition,
                weight,
                loop_restart,
                attrs: raw_attrs,
            });
        }

        let mut forward: HashMap<String, Vec<usize>> = HashMap::new();
        let mut reverse: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, e) in edges.iter().enumerate() {
            forward.entry(e.source.clone()).or_default().push(idx);
            reverse.entry(e.target.clone()).or_default().push(idx);
        }

        let graph = Graph {
            name: dot.name,
            attrs,
            node_order,
            nodes,
            edges,
            forward,
            reverse,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(move |id| self.nodes.get(id))
    }

    pub fn node_ids(&self) -> &[String] {
        &self.node_order
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of `node_id` in declaration order.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.forward
            .get(node_id)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.reverse
            .get(node_id)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes().find(|n| n.shape == "start")
    }

    pub fn exit_nodes(&self) -> Vec<&Node> {
        self.nodes().filter(|n| n.shape == "exit").collect()
    }

    fn validate(&self) -> Result<()> {
        let start_count = self.nodes().filter(|n| n.shape == "start").count();
        if start_count != 1 {
            return Err(EngineError::Validation(format!(
                "graph must have exactly one start node, found {start_count}"
            )));
        }
        if self.exit_nodes().is_empty() {
            return Err(EngineError::Validation(
                "graph must have at least one exit node".to_string(),
            ));
        }
        for node in self.nodes() {
            if node.shape != "exit" && self.outgoing_edges(&node.id).is_empty() {
                return Err(EngineError::Validation(format!(
                    "non-exit node '{}' has no outgoing edges",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(dot: &str) -> Graph {
        let parsed = attractor_dot::parse(dot).expect("dot parses");
        Graph::from_dot(parsed).expect("graph builds")
    }

    #[test]
    fn linear_graph_shapes_resolve() {
        let g = parse(
            r#"digraph P {
                start [shape="Mdiamond"]
                work [shape="box"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        assert_eq!(g.start_node().unwrap().id, "start");
        assert_eq!(g.exit_nodes().len(), 1);
        assert_eq!(g.node("work").unwrap().shape, "codegen");
    }

    #[test]
    fn missing_start_node_fails_validation() {
        let parsed = attractor_dot::parse(
            r#"digraph P {
                a [shape="box"]
                b [shape="Msquare"]
                a -> b
            }"#,
        )
        .unwrap();
        let err = Graph::from_dot(parsed).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn non_exit_node_without_outgoing_edge_fails_validation() {
        let parsed = attractor_dot::parse(
            r#"digraph P {
                start [shape="Mdiamond"]
                orphan [shape="box"]
                done [shape="Msquare"]
                start -> done
            }"#,
        )
        .unwrap();
        let err = Graph::from_dot(parsed).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn edge_attrs_parse_condition_label_weight() {
        let g = parse(
            r#"digraph P {
                start [shape="Mdiamond"]
                a [shape="box"]
                b [shape="box"]
                done [shape="Msquare"]
                start -> a [label="go", weight=5, condition="outcome = success"]
                start -> b
                a -> done
                b -> done
            }"#,
        );
        let edges = g.outgoing_edges("start");
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].label.as_deref(), Some("go"));
        assert_eq!(edges[0].weight, Some(5.0));
        assert_eq!(edges[0].condition, "outcome = success");
        assert!(!edges[1].has_condition());
    }

    #[test]
    fn node_typed_accessors_read_attrs() {
        let g = parse(
            r#"digraph P {
                start [shape="Mdiamond"]
                build [shape="box", goal_gate=true, max_retries=5, tool_command="echo hi"]
                done [shape="Msquare"]
                start -> build -> done
            }"#,
        );
        let build = g.node("build").unwrap();
        assert!(build.goal_gate());
        assert_eq!(build.max_retries(), 5);
        assert_eq!(build.tool_command(), Some("echo hi"));
    }

    #[test]
    fn graph_level_attrs_have_defaults() {
        let g = parse(
            r#"digraph P {
                start [shape="Mdiamond"]
                done [shape="Msquare"]
                start -> done
            }"#,
        );
        assert_eq!(g.attrs.default_max_retry, 50);
        assert_eq!(g.attrs.retry_target, None);
    }
}
