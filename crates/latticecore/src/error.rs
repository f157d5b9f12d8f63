use crate::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Malformed graph. Raised while the graph is built, never during a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Node {node} has no input port '{port}'")]
    UnknownInputPort { node: NodeId, port: String },

    #[error("Node {node} has no output port '{port}'")]
    UnknownOutputPort { node: NodeId, port: String },

    #[error("Connection {from} -> {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },

    #[error("Required input port '{port}' of node {node} has no incoming connection")]
    UnconnectedRequiredPort { node: NodeId, port: String },
}

/// How the engine treats a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retried with backoff until the attempt budget is spent.
    Transient,
    /// Not retried; the node fails.
    Permanent,
    /// Aborts the whole run.
    Fatal,
}

/// Errors raised by node capabilities.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn class(&self) -> FailureClass {
        match self {
            NodeError::Transient(_) | NodeError::Timeout { .. } => FailureClass::Transient,
            NodeError::Fatal(_) => FailureClass::Fatal,
            NodeError::InvalidInputType { .. }
            | NodeError::Configuration(_)
            | NodeError::ExecutionFailed(_)
            | NodeError::Cancelled => FailureClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Serializable error stored in run data and in the run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
    pub class: FailureClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// The failure was transient but the retry budget ran out.
    #[serde(default)]
    pub exhausted: bool,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>, class: FailureClass) -> Self {
        Self {
            message: message.into(),
            class,
            node_id: None,
            exhausted: false,
        }
    }

    pub fn from_node_error(node_id: NodeId, error: &NodeError) -> Self {
        Self {
            message: error.to_string(),
            class: error.class(),
            node_id: Some(node_id),
            exhausted: false,
        }
    }

    /// Transient failure whose retries are spent; recorded as permanent.
    pub fn exhausted(node_id: NodeId, error: &NodeError, attempts: u32) -> Self {
        Self {
            message: format!("{} (gave up after {} attempts)", error, attempts),
            class: FailureClass::Permanent,
            node_id: Some(node_id),
            exhausted: true,
        }
    }

    pub fn cancelled() -> Self {
        Self::new("Run cancelled", FailureClass::Permanent)
    }
}
