use crate::{
    events::EventEmitter, ExecutionId, ExecutionStore, Item, NodeError, NodeId, Value,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Core trait that all executable nodes implement.
///
/// A capability is an opaque unit of work: it receives the items of one
/// dispatch and returns items per output port. It must not assume any
/// ordering relative to nodes on sibling branches.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "transform.set", "time.delay")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Validate parameters before the run starts
    fn validate_parameters(&self, _parameters: &BTreeMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Run-scoped state handed to every task. Nothing here is process-global.
#[derive(Debug, Default)]
pub struct RunContext {
    pub execution_id: ExecutionId,
    pub store: ExecutionStore,
    dispatches: AtomicU64,
    invocations: AtomicU64,
}

impl RunContext {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            ..Self::default()
        }
    }

    pub fn record_dispatch(&self) -> u64 {
        self.dispatches.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_invocation(&self) -> u64 {
        self.invocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Dispatch attempts started in this run (retries included).
    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Calls made into node capabilities; an `each` dispatch calls once per item.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

/// Execution context passed to each node invocation
#[derive(Clone)]
pub struct NodeContext {
    /// Node instance the invocation belongs to. For a coalesced dispatch this
    /// is the first member of the batch.
    pub node_id: NodeId,

    /// Input items. A capability may report lineage by filling
    /// `paired_item` on its outputs with indexes into this list.
    pub items: Vec<Item>,

    /// Resolved parameters for this node
    pub parameters: Arc<BTreeMap<String, Value>>,

    /// Attempt number, starting at 1
    pub attempt: u32,

    /// Shared run state (execution store, counters)
    pub run: Arc<RunContext>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Raised when the run is cancelled or aborted
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Get parameter or return error
    pub fn require_parameter(&self, name: &str) -> Result<&Value, NodeError> {
        self.parameters
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing parameter: {}", name)))
    }

    /// Get parameter with default
    pub fn parameter_or(&self, name: &str, default: Value) -> Value {
        self.parameters.get(name).cloned().unwrap_or(default)
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.run.store
    }
}

/// Output from node execution, indexed by output port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub ports: Vec<Vec<Item>>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// All items on the first output port.
    pub fn single(items: Vec<Item>) -> Self {
        Self { ports: vec![items] }
    }

    pub fn with_port(mut self, port: usize, items: Vec<Item>) -> Self {
        if self.ports.len() <= port {
            self.ports.resize_with(port + 1, Vec::new);
        }
        self.ports[port] = items;
        self
    }

    pub fn item_count(&self) -> usize {
        self.ports.iter().map(Vec::len).sum()
    }
}
