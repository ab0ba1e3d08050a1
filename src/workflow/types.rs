/// Core workflow type definitions
///
/// A workflow document is a set of named nodes plus ordered connection groups
/// between them. Documents are deserialized from JSON and never mutated while
/// a run is in progress.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// An ordered list of rules leaving a node. A node may declare several groups
/// (one per output); they are followed in declaration order.
pub type ConnectionGroup = Vec<ConnectionRule>;

/// A complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable identifier used by storage and the scheduler. Falls back to
    /// `name` when absent from the document.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Only active workflows are held by the registry and scheduled
    #[serde(default = "default_active")]
    pub active: bool,
    /// Workflow-level variables exposed to expressions as `$global`
    #[serde(default)]
    pub global: Map<String, Value>,
    /// Nodes in declaration order. The first node is the fallback start node.
    pub nodes: Vec<Node>,
    /// Source node name -> connection groups
    #[serde(default)]
    pub connections: HashMap<String, Vec<ConnectionGroup>>,
}

fn default_active() -> bool {
    true
}

impl Workflow {
    /// Identifier used for registry, storage and scheduling keys
    pub fn key(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }

    /// Look up a node by its unique name
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Connection groups declared for `source`, empty when it has none
    pub fn outgoing(&self, source: &str) -> &[ConnectionGroup] {
        self.connections
            .get(source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The first timer node, the only one the scheduler honours
    pub fn timer_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|node| node.node_type == NodeType::Timer)
    }
}

/// A single typed step in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within the workflow; the node's identity
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Arbitrary nested parameters, may contain `{{ expr }}` or `=expr` forms
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Node types understood by the executor
///
/// Serialized as the lowercase type string used in workflow documents.
/// Unknown types are kept verbatim and executed as pass-through nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    /// Started by hand
    Manual,
    /// Started by an inbound HTTP call; may also issue a request when given a `url`
    Webhook,
    /// Started by the recurring scheduler
    Timer,
    /// Outbound HTTP request
    Http,
    /// Sandboxed script (`js` in documents)
    Script,
    /// Suspends the run for a number of seconds
    Wait,
    /// Anything else: parameters are passed through as output
    Other(String),
}

impl NodeType {
    /// Whether nodes of this type are eligible to start a run
    pub fn is_trigger(&self) -> bool {
        matches!(self, NodeType::Manual | NodeType::Webhook | NodeType::Timer)
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Manual => "manual",
            NodeType::Webhook => "webhook",
            NodeType::Timer => "timer",
            NodeType::Http => "http",
            NodeType::Script => "js",
            NodeType::Wait => "wait",
            NodeType::Other(name) => name,
        }
    }
}

impl From<String> for NodeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "manual" => NodeType::Manual,
            "webhook" => NodeType::Webhook,
            "timer" => NodeType::Timer,
            "http" => NodeType::Http,
            "js" | "script" | "lua" => NodeType::Script,
            "wait" => NodeType::Wait,
            _ => NodeType::Other(value),
        }
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge to `node`, optionally guarded by a `when` expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRule {
    /// Target node name
    pub node: String,
    /// Guard evaluated against the run context; absent means unconditional
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

impl ConnectionRule {
    pub fn to(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            when: None,
        }
    }

    pub fn when(node: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            when: Some(condition.into()),
        }
    }
}
