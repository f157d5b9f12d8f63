use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;

/// Name of the port created when a node spec declares none.
pub const MAIN_PORT: &str = "main";

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) {
        self.connections
            .push(Connection::new(from_node, from_port, to_node, to_port));
    }

    /// Connect the main ports of two nodes.
    pub fn connect_main(&mut self, from_node: NodeId, to_node: NodeId) {
        self.connect(from_node, MAIN_PORT, to_node, MAIN_PORT);
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Whether a node runs once per item or once over all items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Each,
    #[default]
    Once,
}

/// How a node with several input ports combines them into one sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    #[default]
    Append,
    Pairwise,
}

/// Declared input port of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputPort {
    pub name: String,
    /// A mandatory port whose producers all failed or were skipped causes the
    /// node to be skipped instead of running with an empty port.
    #[serde(default)]
    pub required: bool,
}

impl InputPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }

    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }
}

fn default_inputs() -> Vec<InputPort> {
    vec![InputPort::new(MAIN_PORT)]
}

fn default_outputs() -> Vec<String> {
    vec![MAIN_PORT.to_string()]
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Resolved parameters; no templating happens inside the engine.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default = "default_inputs")]
    pub inputs: Vec<InputPort>,
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub merge: MergeMode,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl NodeSpec {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_type: node_type.into(),
            name: None,
            parameters: BTreeMap::new(),
            inputs: default_inputs(),
            outputs: default_outputs(),
            mode: ExecutionMode::default(),
            merge: MergeMode::default(),
            position: None,
            retry_policy: None,
            timeout_ms: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_merge(mut self, merge: MergeMode) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<InputPort>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Display name, falling back to the node type.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.node_type)
    }

    pub fn input_index(&self, port: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == port)
    }

    pub fn output_index(&self, port: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p == port)
    }
}

/// Connection between nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
    /// "On error continue": if the producer fails, the consumer receives an
    /// empty item set on this port instead of being skipped.
    #[serde(default)]
    pub error_tolerant: bool,
}

impl Connection {
    pub fn new(
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) -> Self {
        Self {
            from_node,
            from_port: from_port.into(),
            to_node,
            to_port: to_port.into(),
            error_tolerant: false,
        }
    }

    pub fn error_tolerant(mut self) -> Self {
        self.error_tolerant = true;
        self
    }
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Bounded exponential backoff for transient node failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total dispatch attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Upper bound of the uniformly random jitter added to each delay.
    pub max_jitter_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_jitter_ms(mut self, max_jitter_ms: u64) -> Self {
        self.max_jitter_ms = max_jitter_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_jitter_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}
