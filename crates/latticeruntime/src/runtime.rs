use crate::{registry::NodeRegistry, RunResult, WorkflowExecutor};
use latticecore::{
    EventBus, ExecutionEvent, ExecutionId, FlowError, Graph, Item, RetryPolicy, Workflow,
    WorkflowId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Arc<Graph>>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        Self::with_registry(registry, config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let executor = Arc::new(WorkflowExecutor::new(&config));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            executor,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get access to the node registry
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Validate and register a workflow
    pub async fn register_workflow(&self, workflow: &Workflow) -> Result<(), FlowError> {
        let graph = Graph::from_workflow(workflow)?;
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id, Arc::new(graph));
        Ok(())
    }

    /// Execute a registered workflow by ID
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        initial_items: Vec<Item>,
    ) -> Result<RunResult, FlowError> {
        let graph = self
            .workflows
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| FlowError::Execution(format!("Workflow not found: {}", workflow_id)))?;
        self.run(graph, initial_items).await
    }

    /// Execute a workflow definition directly (without registration)
    pub async fn execute(
        &self,
        workflow: &Workflow,
        initial_items: Vec<Item>,
    ) -> Result<RunResult, FlowError> {
        let graph = Arc::new(Graph::from_workflow(workflow)?);
        self.run(graph, initial_items).await
    }

    /// Run a graph to completion.
    pub async fn run(&self, graph: Arc<Graph>, initial_items: Vec<Item>) -> Result<RunResult, FlowError> {
        self.start(graph, initial_items).wait().await
    }

    /// Start a run in the background; the handle can cancel it.
    pub fn start(&self, graph: Arc<Graph>, initial_items: Vec<Item>) -> ExecutionHandle {
        self.start_with_cancellation(graph, initial_items, CancellationToken::new())
    }

    /// Start a run that also stops when `cancellation` is raised by its owner.
    pub fn start_with_cancellation(
        &self,
        graph: Arc<Graph>,
        initial_items: Vec<Item>,
        cancellation: CancellationToken,
    ) -> ExecutionHandle {
        let execution_id = ExecutionId::new_v4();
        let executor = self.executor.clone();
        let registry = self.registry.clone();
        let events = self.event_bus.clone();
        let token = cancellation.clone();

        let task = tokio::spawn(async move {
            executor
                .execute(graph, &registry, events, initial_items, execution_id, token)
                .await
        });

        ExecutionHandle {
            execution_id,
            cancellation,
            task,
        }
    }

    /// Best-effort cooperative cancellation of a started run
    pub fn cancel(&self, handle: &ExecutionHandle) {
        handle.cancel();
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for a run started with [`FlowRuntime::start`]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    cancellation: CancellationToken,
    task: JoinHandle<Result<RunResult, FlowError>>,
}

impl ExecutionHandle {
    /// Stop dispatching new nodes; in-flight nodes see their cancellation
    /// token raised and the run finishes once they return.
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested for run {}", self.execution_id);
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait for the run to end and return its result.
    pub async fn wait(self) -> Result<RunResult, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Dispatches (single nodes or coalesced groups) allowed in flight.
    pub max_parallel_dispatches: usize,
    pub event_buffer_size: usize,
    /// Used for nodes that do not declare their own policy.
    pub retry: RetryPolicy,
    /// Per-attempt timeout for nodes that do not declare their own.
    pub default_timeout_ms: Option<u64>,
    /// Coalesce structurally identical ready nodes.
    pub batching: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_dispatches: 10,
            event_buffer_size: 1000,
            retry: RetryPolicy::default(),
            default_timeout_ms: None,
            batching: true,
        }
    }
}

impl RuntimeConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads `LATTICE_MAX_PARALLEL`, `LATTICE_EVENT_BUFFER`,
    /// `LATTICE_RETRY_MAX_ATTEMPTS`, `LATTICE_RETRY_BASE_DELAY_MS`,
    /// `LATTICE_RETRY_MAX_DELAY_MS`, `LATTICE_NODE_TIMEOUT_MS` and
    /// `LATTICE_BATCHING`; unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: parse(&lookup, "LATTICE_RETRY_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts),
            base_delay_ms: parse(&lookup, "LATTICE_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry.base_delay_ms),
            max_delay_ms: parse(&lookup, "LATTICE_RETRY_MAX_DELAY_MS")
                .unwrap_or(defaults.retry.max_delay_ms),
            ..defaults.retry.clone()
        };

        Self {
            max_parallel_dispatches: parse(&lookup, "LATTICE_MAX_PARALLEL")
                .unwrap_or(defaults.max_parallel_dispatches),
            event_buffer_size: parse(&lookup, "LATTICE_EVENT_BUFFER")
                .unwrap_or(defaults.event_buffer_size),
            retry,
            default_timeout_ms: parse(&lookup, "LATTICE_NODE_TIMEOUT_MS")
                .or(defaults.default_timeout_ms),
            batching: parse(&lookup, "LATTICE_BATCHING").unwrap_or(defaults.batching),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("LATTICE_MAX_PARALLEL", "4"),
            ("LATTICE_RETRY_MAX_ATTEMPTS", "2"),
            ("LATTICE_NODE_TIMEOUT_MS", "1500"),
            ("LATTICE_BATCHING", "false"),
            ("LATTICE_EVENT_BUFFER", "lots"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_parallel_dispatches, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.default_timeout_ms, Some(1500));
        assert!(!config.batching);
        assert_eq!(config.event_buffer_size, 1000);
    }
}
