use async_trait::async_trait;
use latticecore::{
    Connection, ExecutionEvent, ExecutionMode, FailureClass, FlowError, Graph, InputPort, Item,
    ItemRef, MergeMode, Node, NodeContext, NodeError, NodeId, NodeOutput, NodeSpec, NodeStatus,
    RetryPolicy, RunWarning, SkipReason, Value, Workflow,
};
use latticeruntime::{FlowRuntime, NodeFactory, NodeMetadata, NodeRegistry, RunResult, RuntimeConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Shared view into what a test node type was asked to do.
#[derive(Default)]
struct CallLog {
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    started: Notify,
}

impl CallLog {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

/// Test capability driven by its parameters:
/// `emit` produces fresh items, `fail`/`times` inject failures,
/// `block` waits for cancellation, `sleep_ms` delays, `split` routes item
/// `i` to output port `i`. Anything else passes items through.
struct ScriptNode {
    node_type: String,
    log: Arc<CallLog>,
}

#[async_trait]
impl Node for ScriptNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.log.calls.fetch_add(1, Ordering::SeqCst);
        self.log.batch_sizes.lock().unwrap().push(ctx.items.len());
        self.log.started.notify_one();

        let params = &ctx.parameters;
        if let Some(class) = params.get("fail").and_then(|v| v.as_str()) {
            let times = params.get("times").and_then(|v| v.as_f64()).map_or(u32::MAX, |n| n as u32);
            if ctx.attempt <= times {
                return Err(match class {
                    "transient" => NodeError::Transient("flaky".to_string()),
                    "fatal" => NodeError::Fatal("meltdown".to_string()),
                    _ => NodeError::ExecutionFailed("broken".to_string()),
                });
            }
        }
        if params.get("block").and_then(|v| v.as_bool()) == Some(true) {
            ctx.cancellation.cancelled().await;
            return Err(NodeError::Cancelled);
        }
        if let Some(ms) = params.get("sleep_ms").and_then(|v| v.as_f64()) {
            sleep(Duration::from_millis(ms as u64)).await;
        }
        if let Some(count) = params.get("emit").and_then(|v| v.as_f64()) {
            let label = params.get("label").cloned().unwrap_or(Value::Null);
            let items = (0..count as i64)
                .map(|i| Item::new().with_field("src", label.clone()).with_field("i", i))
                .collect();
            return Ok(NodeOutput::single(items));
        }
        if params.get("split").and_then(|v| v.as_bool()) == Some(true) {
            let mut output = NodeOutput::new();
            for (index, item) in ctx.items.into_iter().enumerate() {
                output = output.with_port(index, vec![item.paired_with(index)]);
            }
            return Ok(output);
        }
        Ok(NodeOutput::single(ctx.items))
    }
}

struct ScriptFactory {
    node_type: &'static str,
    batchable: bool,
    log: Arc<CallLog>,
}

impl NodeFactory for ScriptFactory {
    fn create(&self, _parameters: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ScriptNode {
            node_type: self.node_type.to_string(),
            log: self.log.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            batchable: self.batchable,
            ..NodeMetadata::default()
        }
    }
}

struct Harness {
    runtime: FlowRuntime,
    script: Arc<CallLog>,
    batch: Arc<CallLog>,
    block: Arc<CallLog>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay_ms(1)
        .with_jitter_ms(0)
        .with_max_delay_ms(5)
}

fn harness(config: RuntimeConfig) -> Harness {
    let script = Arc::new(CallLog::default());
    let batch = Arc::new(CallLog::default());
    let block = Arc::new(CallLog::default());

    let mut registry = NodeRegistry::new();
    for (node_type, batchable, log) in [
        ("test.script", false, &script),
        ("test.batch", true, &batch),
        ("test.block", false, &block),
    ] {
        registry.register(Arc::new(ScriptFactory {
            node_type,
            batchable,
            log: log.clone(),
        }));
    }

    Harness {
        runtime: FlowRuntime::with_registry(Arc::new(registry), config),
        script,
        batch,
        block,
    }
}

fn default_harness() -> Harness {
    harness(RuntimeConfig {
        retry: fast_retry(),
        ..RuntimeConfig::default()
    })
}

fn items(count: usize) -> Vec<Item> {
    (0..count)
        .map(|i| Item::new().with_field("n", i as i64))
        .collect()
}

fn emitter(label: &str, count: i64) -> NodeSpec {
    NodeSpec::new("test.script")
        .with_parameter("emit", count)
        .with_parameter("label", label)
}

fn field_str<'a>(item: &'a Item, name: &str) -> Option<&'a str> {
    item.get(name).and_then(|v| v.as_str())
}

fn outputs(result: &RunResult, node: NodeId) -> Vec<Item> {
    result
        .run_data
        .output_items(node, 0)
        .map(<[Item]>::to_vec)
        .unwrap_or_default()
}

async fn run(harness: &Harness, workflow: &Workflow, input: Vec<Item>) -> RunResult {
    timeout(Duration::from_secs(10), harness.runtime.execute(workflow, input))
        .await
        .expect("run timed out")
        .expect("run could not start")
}

#[tokio::test]
async fn test_linear_chain_tracks_lineage() {
    let harness = default_harness();
    let mut workflow = Workflow::new("chain");
    let a = workflow.add_node(NodeSpec::new("test.script").with_name("A"));
    let b = workflow.add_node(NodeSpec::new("test.script").with_name("B"));
    workflow.connect_main(a, b);

    let result = run(&harness, &workflow, items(3)).await;

    assert!(result.finished);
    assert!(result.error.is_none());
    assert_eq!(result.succeeded(), 2);
    let out = outputs(&result, b);
    assert_eq!(out.len(), 3);
    assert_eq!(out[2].get("n").and_then(|v| v.as_f64()), Some(2.0));

    let roots = result.run_data.lineage(ItemRef {
        node_id: b,
        output: 0,
        item: 2,
    });
    assert_eq!(
        roots,
        vec![ItemRef {
            node_id: a,
            output: 0,
            item: 2
        }]
    );
}

#[tokio::test]
async fn test_append_merge_concatenates_in_connection_order() {
    let harness = default_harness();
    let mut workflow = Workflow::new("append");
    let a = workflow.add_node(emitter("a", 3));
    let b = workflow.add_node(emitter("b", 2));
    let c = workflow.add_node(NodeSpec::new("test.script"));
    workflow.connect_main(a, c);
    workflow.connect_main(b, c);

    let result = run(&harness, &workflow, Vec::new()).await;

    let out = outputs(&result, c);
    let sources: Vec<&str> = out.iter().filter_map(|i| field_str(i, "src")).collect();
    assert_eq!(sources, vec!["a", "a", "a", "b", "b"]);

    let roots = result.run_data.lineage(ItemRef {
        node_id: c,
        output: 0,
        item: 3,
    });
    assert_eq!(
        roots,
        vec![ItemRef {
            node_id: b,
            output: 0,
            item: 0
        }]
    );
}

#[tokio::test]
async fn test_pairwise_merge_truncates_with_warning() {
    let harness = default_harness();
    let mut workflow = Workflow::new("pairwise");
    let a = workflow.add_node(emitter("a", 3));
    let b = workflow.add_node(emitter("b", 2));
    let c = workflow.add_node(
        NodeSpec::new("test.script")
            .with_inputs(vec![InputPort::new("left"), InputPort::new("right")])
            .with_merge(MergeMode::Pairwise),
    );
    workflow.connect(a, "main", c, "left");
    workflow.connect(b, "main", c, "right");

    let result = run(&harness, &workflow, Vec::new()).await;

    let out = outputs(&result, c);
    assert_eq!(out.len(), 2);
    assert_eq!(field_str(&out[0], "src"), Some("b"));

    let record = result.run_data.latest(c).unwrap();
    assert_eq!(
        record.warnings,
        vec![RunWarning::MergeLengthMismatch {
            port_lengths: vec![3, 2],
            combined: 2,
            unconsumed: 1,
        }]
    );

    let roots = result.run_data.lineage(ItemRef {
        node_id: c,
        output: 0,
        item: 1,
    });
    assert_eq!(roots.len(), 2);
    assert!(roots.contains(&ItemRef {
        node_id: a,
        output: 0,
        item: 1
    }));
    assert!(roots.contains(&ItemRef {
        node_id: b,
        output: 0,
        item: 1
    }));
}

#[tokio::test]
async fn test_transient_failure_exhausts_retry_budget() {
    let harness = default_harness();
    let mut events = harness.runtime.subscribe_events();
    let mut workflow = Workflow::new("flaky");
    let a = workflow.add_node(NodeSpec::new("test.script").with_parameter("fail", "transient"));

    let result = run(&harness, &workflow, items(1)).await;

    assert_eq!(harness.script.calls(), 5);
    assert_eq!(result.status(a), Some(NodeStatus::Failed));
    let record = result.run_data.latest(a).unwrap();
    assert_eq!(record.attempt, 5);
    assert_eq!(record.failed_attempts.len(), 4);
    let error = record.error().unwrap();
    assert!(error.exhausted);
    assert_eq!(error.class, FailureClass::Permanent);
    assert_eq!(result.error.as_ref().and_then(|e| e.node_id), Some(a));
    assert!(result.finished);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::AttemptFailed { node_id, .. } = event {
            assert_eq!(node_id, a);
            retries += 1;
        }
    }
    assert_eq!(retries, 4);
}

#[tokio::test]
async fn test_transient_failure_recovers_on_third_attempt() {
    let harness = default_harness();
    let mut workflow = Workflow::new("recovering");
    let a = workflow.add_node(
        NodeSpec::new("test.script")
            .with_parameter("fail", "transient")
            .with_parameter("times", 2i64),
    );

    let result = run(&harness, &workflow, items(2)).await;

    assert_eq!(result.status(a), Some(NodeStatus::Succeeded));
    assert_eq!(result.run_data.records(a).len(), 1);
    let record = result.run_data.latest(a).unwrap();
    assert!(record.is_success());
    assert_eq!(record.attempt, 3);
    assert_eq!(record.failed_attempts.len(), 2);
    assert_eq!(record.total_attempts(), 3);
    assert_eq!(outputs(&result, a).len(), 2);
}

#[tokio::test]
async fn test_permanent_failure_skips_downstream() {
    let harness = default_harness();
    let mut workflow = Workflow::new("broken");
    let a = workflow.add_node(NodeSpec::new("test.script").with_parameter("fail", "permanent"));
    let b = workflow.add_node(NodeSpec::new("test.script"));
    let side = workflow.add_node(NodeSpec::new("test.script"));
    workflow.connect_main(a, b);

    let result = run(&harness, &workflow, items(1)).await;

    assert_eq!(harness.script.calls(), 2);
    assert_eq!(result.status(a), Some(NodeStatus::Failed));
    assert_eq!(
        result.status(b),
        Some(NodeStatus::Skipped {
            reason: SkipReason::UpstreamFailed
        })
    );
    assert_eq!(result.status(side), Some(NodeStatus::Succeeded));
    assert!(result.finished);
    assert_eq!(
        result.error.as_ref().map(|e| e.class),
        Some(FailureClass::Permanent)
    );
}

#[tokio::test]
async fn test_error_tolerant_edge_delivers_empty_input() {
    let harness = default_harness();
    let mut workflow = Workflow::new("tolerant");
    let a = workflow.add_node(NodeSpec::new("test.script").with_parameter("fail", "permanent"));
    let b = workflow.add_node(NodeSpec::new("test.script"));
    workflow
        .connections
        .push(Connection::new(a, "main", b, "main").error_tolerant());

    let result = run(&harness, &workflow, items(1)).await;

    assert_eq!(result.status(a), Some(NodeStatus::Failed));
    assert_eq!(result.status(b), Some(NodeStatus::Succeeded));
    assert_eq!(result.run_data.latest(b).unwrap().input_count, 0);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_required_port_without_live_producer_is_skipped() {
    let harness = default_harness();
    let mut workflow = Workflow::new("required");
    let a = workflow.add_node(NodeSpec::new("test.script").with_parameter("fail", "permanent"));
    let b = workflow.add_node(emitter("b", 1));
    let c = workflow.add_node(
        NodeSpec::new("test.script")
            .with_inputs(vec![InputPort::required("left"), InputPort::new("right")]),
    );
    workflow.connect(a, "main", c, "left");
    workflow.connect(b, "main", c, "right");

    let result = run(&harness, &workflow, Vec::new()).await;

    assert_eq!(result.status(b), Some(NodeStatus::Succeeded));
    assert_eq!(
        result.status(c),
        Some(NodeStatus::Skipped {
            reason: SkipReason::UpstreamFailed
        })
    );
}

#[tokio::test]
async fn test_fatal_failure_aborts_run() {
    let harness = default_harness();
    let mut workflow = Workflow::new("fatal");
    let a = workflow.add_node(NodeSpec::new("test.script").with_parameter("fail", "fatal"));
    let slow = workflow.add_node(NodeSpec::new("test.block").with_parameter("block", true));
    let after = workflow.add_node(NodeSpec::new("test.script"));
    workflow.connect_main(slow, after);

    let result = run(&harness, &workflow, items(1)).await;

    assert!(!result.finished);
    assert_eq!(result.status(a), Some(NodeStatus::Failed));
    assert_eq!(result.status(slow), Some(NodeStatus::Failed));
    assert_eq!(
        result.status(after),
        Some(NodeStatus::Skipped {
            reason: SkipReason::Aborted
        })
    );
    let error = result.error.unwrap();
    assert_eq!(error.class, FailureClass::Fatal);
    assert_eq!(error.node_id, Some(a));
}

#[tokio::test]
async fn test_identical_siblings_are_coalesced() {
    let harness = default_harness();
    let mut workflow = Workflow::new("coalesce");
    let split = workflow.add_node(
        NodeSpec::new("test.script")
            .with_parameter("split", true)
            .with_outputs(["a", "b"]),
    );
    let x = workflow.add_node(
        NodeSpec::new("test.batch")
            .with_parameter("model", "v2")
            .with_mode(ExecutionMode::Each),
    );
    let y = workflow.add_node(
        NodeSpec::new("test.batch")
            .with_parameter("model", "v2")
            .with_mode(ExecutionMode::Each),
    );
    workflow.connect(split, "a", x, "main");
    workflow.connect(split, "b", y, "main");

    let result = run(&harness, &workflow, items(2)).await;

    assert_eq!(harness.batch.calls(), 1);
    assert_eq!(harness.batch.batch_sizes(), vec![2]);

    for (member, port) in [(x, 0), (y, 1)] {
        let record = result.run_data.latest(member).unwrap();
        assert_eq!(record.mode, ExecutionMode::Once);
        assert_eq!(record.batch.as_ref().map(|b| b.members.clone()), Some(vec![x, y]));

        let out = outputs(&result, member);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("n").and_then(|v| v.as_f64()), Some(port as f64));

        let roots = result.run_data.lineage(ItemRef {
            node_id: member,
            output: 0,
            item: 0,
        });
        assert_eq!(
            roots,
            vec![ItemRef {
                node_id: split,
                output: port,
                item: 0
            }]
        );
    }
}

#[tokio::test]
async fn test_different_parameters_are_not_coalesced() {
    let harness = default_harness();
    let mut workflow = Workflow::new("distinct");
    let split = workflow.add_node(
        NodeSpec::new("test.script")
            .with_parameter("split", true)
            .with_outputs(["a", "b"]),
    );
    let x = workflow.add_node(NodeSpec::new("test.batch").with_parameter("model", "v2"));
    let y = workflow.add_node(NodeSpec::new("test.batch").with_parameter("model", "v3"));
    workflow.connect(split, "a", x, "main");
    workflow.connect(split, "b", y, "main");

    let result = run(&harness, &workflow, items(2)).await;

    assert_eq!(harness.batch.calls(), 2);
    assert_eq!(harness.batch.batch_sizes(), vec![1, 1]);
    assert!(result.run_data.latest(x).unwrap().batch.is_none());
}

#[tokio::test]
async fn test_batching_switch_disables_coalescing() {
    let harness = harness(RuntimeConfig {
        batching: false,
        retry: fast_retry(),
        ..RuntimeConfig::default()
    });
    let mut workflow = Workflow::new("no-batching");
    let split = workflow.add_node(
        NodeSpec::new("test.script")
            .with_parameter("split", true)
            .with_outputs(["a", "b"]),
    );
    let x = workflow.add_node(NodeSpec::new("test.batch"));
    let y = workflow.add_node(NodeSpec::new("test.batch"));
    workflow.connect(split, "a", x, "main");
    workflow.connect(split, "b", y, "main");

    run(&harness, &workflow, items(2)).await;

    assert_eq!(harness.batch.calls(), 2);
}

#[tokio::test]
async fn test_cancellation_skips_undispatched_nodes() {
    let harness = harness(RuntimeConfig {
        max_parallel_dispatches: 1,
        retry: fast_retry(),
        ..RuntimeConfig::default()
    });
    let mut workflow = Workflow::new("cancel");
    let a = workflow.add_node(NodeSpec::new("test.script"));
    let c = workflow.add_node(NodeSpec::new("test.block").with_parameter("block", true));
    let b = workflow.add_node(NodeSpec::new("test.script"));
    workflow.connect_main(a, b);

    let graph = Arc::new(Graph::from_workflow(&workflow).unwrap());
    let handle = harness.runtime.start(graph, items(1));
    timeout(Duration::from_secs(5), harness.block.started.notified())
        .await
        .expect("blocking node never started");
    harness.runtime.cancel(&handle);

    let result = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run did not end")
        .unwrap();

    assert!(!result.finished);
    assert_eq!(result.status(a), Some(NodeStatus::Succeeded));
    assert_eq!(
        result.status(b),
        Some(NodeStatus::Skipped {
            reason: SkipReason::Cancelled
        })
    );
    assert_eq!(result.status(c), Some(NodeStatus::Failed));
    assert_eq!(harness.script.calls(), 1);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_cancel_right_after_start_dispatches_nothing() {
    let harness = default_harness();
    let mut workflow = Workflow::new("cancel-early");
    let a = workflow.add_node(NodeSpec::new("test.script"));
    let b = workflow.add_node(NodeSpec::new("test.script"));
    workflow.connect_main(a, b);

    let graph = Arc::new(Graph::from_workflow(&workflow).unwrap());
    let handle = harness.runtime.start(graph, items(2));
    harness.runtime.cancel(&handle);

    let result = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run did not end")
        .unwrap();

    assert!(!result.finished);
    for node in [a, b] {
        assert_eq!(
            result.status(node),
            Some(NodeStatus::Skipped {
                reason: SkipReason::Cancelled
            })
        );
        assert!(result.run_data.records(node).is_empty());
    }
    assert_eq!(harness.script.calls(), 0);
}

/// Raises the run's own token before handing its items back.
struct CancelRunNode {
    token: CancellationToken,
}

#[async_trait]
impl Node for CancelRunNode {
    fn node_type(&self) -> &str {
        "test.cancel_run"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.token.cancel();
        Ok(NodeOutput::single(ctx.items))
    }
}

struct CancelRunFactory {
    token: CancellationToken,
}

impl NodeFactory for CancelRunFactory {
    fn create(&self, _parameters: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(CancelRunNode {
            token: self.token.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        "test.cancel_run"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

#[tokio::test]
async fn test_cancel_during_last_running_node_skips_its_successors() {
    for _ in 0..20 {
        let token = CancellationToken::new();
        let log = Arc::new(CallLog::default());
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(CancelRunFactory {
            token: token.clone(),
        }));
        registry.register(Arc::new(ScriptFactory {
            node_type: "test.script",
            batchable: false,
            log: log.clone(),
        }));
        let runtime = FlowRuntime::with_registry(
            Arc::new(registry),
            RuntimeConfig {
                retry: fast_retry(),
                ..RuntimeConfig::default()
            },
        );

        let mut workflow = Workflow::new("cancel-inside");
        let a = workflow.add_node(NodeSpec::new("test.cancel_run"));
        let b = workflow.add_node(NodeSpec::new("test.script"));
        workflow.connect_main(a, b);

        let graph = Arc::new(Graph::from_workflow(&workflow).unwrap());
        let handle = runtime.start_with_cancellation(graph, items(1), token);
        let result = timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("cancelled run did not end")
            .unwrap();

        assert!(!result.finished);
        assert_eq!(result.status(a), Some(NodeStatus::Succeeded));
        assert_eq!(
            result.status(b),
            Some(NodeStatus::Skipped {
                reason: SkipReason::Cancelled
            })
        );
        assert!(result.run_data.records(b).is_empty());
        assert_eq!(log.calls(), 0);
    }
}

#[tokio::test]
async fn test_timeout_is_retried_then_fails() {
    let harness = harness(RuntimeConfig {
        retry: fast_retry().with_max_attempts(2),
        ..RuntimeConfig::default()
    });
    let mut workflow = Workflow::new("slow");
    let a = workflow.add_node(
        NodeSpec::new("test.script")
            .with_parameter("sleep_ms", 500i64)
            .with_timeout_ms(20),
    );

    let result = run(&harness, &workflow, items(1)).await;

    assert_eq!(harness.script.calls(), 2);
    let record = result.run_data.latest(a).unwrap();
    assert_eq!(record.failed_attempts.len(), 1);
    assert_eq!(record.failed_attempts[0].error.class, FailureClass::Transient);
    assert!(record.error().unwrap().exhausted);
}

#[tokio::test]
async fn test_each_mode_invokes_per_item() {
    let harness = default_harness();
    let mut workflow = Workflow::new("each");
    let a = workflow.add_node(NodeSpec::new("test.script").with_mode(ExecutionMode::Each));

    let result = run(&harness, &workflow, items(3)).await;

    assert_eq!(harness.script.batch_sizes(), vec![1, 1, 1]);
    let pairing: Vec<usize> = outputs(&result, a)
        .iter()
        .map(|item| item.paired_item[0].item)
        .collect();
    assert_eq!(pairing, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_run_emits_lifecycle_events() {
    let harness = default_harness();
    let mut events = harness.runtime.subscribe_events();
    let mut workflow = Workflow::new("events");
    let a = workflow.add_node(NodeSpec::new("test.script"));

    let result = run(&harness, &workflow, items(1)).await;

    let mut transitions = Vec::new();
    let mut started = false;
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ExecutionEvent::RunStarted { execution_id, .. } => {
                assert_eq!(execution_id, result.execution_id);
                started = true;
            }
            ExecutionEvent::NodeStateChanged { node_id, status, .. } if node_id == a => {
                transitions.push(status)
            }
            ExecutionEvent::RunCompleted { finished, .. } => {
                assert!(finished);
                completed = true;
            }
            _ => {}
        }
    }
    assert!(started && completed);
    assert_eq!(
        transitions,
        vec![
            NodeStatus::Ready,
            NodeStatus::Dispatched,
            NodeStatus::Succeeded
        ]
    );
}

#[tokio::test]
async fn test_registered_workflow_runs_by_id() {
    let harness = default_harness();
    let mut workflow = Workflow::new("registered");
    workflow.add_node(NodeSpec::new("test.script"));
    harness.runtime.register_workflow(&workflow).await.unwrap();

    let result = harness
        .runtime
        .execute_workflow(workflow.id, items(1))
        .await
        .unwrap();
    assert!(result.finished);

    let missing = harness
        .runtime
        .execute_workflow(uuid::Uuid::new_v4(), Vec::new())
        .await;
    assert!(matches!(missing, Err(FlowError::Execution(_))));
}

#[tokio::test]
async fn test_unknown_node_type_fails_before_start() {
    let harness = default_harness();
    let mut workflow = Workflow::new("unknown");
    workflow.add_node(NodeSpec::new("test.missing"));

    let result = harness.runtime.execute(&workflow, Vec::new()).await;
    assert!(matches!(result, Err(FlowError::UnknownNodeType(t)) if t == "test.missing"));
    assert_eq!(harness.script.calls(), 0);
}

#[tokio::test]
async fn test_cycles_are_rejected() {
    let harness = default_harness();
    let mut workflow = Workflow::new("cycle");
    let a = workflow.add_node(NodeSpec::new("test.script"));
    let b = workflow.add_node(NodeSpec::new("test.script"));
    workflow.connect_main(a, b);
    workflow.connect_main(b, a);

    let result = harness.runtime.execute(&workflow, Vec::new()).await;
    assert!(matches!(result, Err(FlowError::Graph(_))));
}
