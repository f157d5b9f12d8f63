//! The scheduling control loop.
//!
//! A single coordinating loop owns all run state. Node dispatches run as
//! independent tokio tasks that receive their own input items and return
//! their own outputs; the loop applies each completion in one step (record
//! run data, update node states, admit newly ready nodes) and is the only
//! writer of that state.

use crate::batch::{self, BatchGroup, BatchKey, ReadyNode};
use crate::dispatch::DispatchRequest;
use crate::merge::{self, MergedInput, PortInput};
use crate::registry::NodeRegistry;
use crate::retry::{self, RetryOutcome};
use crate::runtime::RuntimeConfig;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use latticecore::{
    BatchInfo, ErrorDescriptor, EventBus, ExecutionEvent, ExecutionId, ExecutionRecord,
    FailureClass, FlowError, Graph, Item, ItemRef, Node, NodeError, NodeId, NodeStatus, Outcome,
    RetryPolicy, RunContext, RunData, SkipReason, Value,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;

/// Outcome of a run: the full trace plus the final state of every node.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub execution_id: ExecutionId,
    /// The run reached its natural end: not cancelled, not aborted.
    pub finished: bool,
    pub run_data: RunData,
    pub error: Option<ErrorDescriptor>,
    pub states: HashMap<NodeId, NodeStatus>,
}

impl RunResult {
    pub fn status(&self, node_id: NodeId) -> Option<NodeStatus> {
        self.states.get(&node_id).copied()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, NodeStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, NodeStatus::Failed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, NodeStatus::Skipped { .. }))
    }

    fn count(&self, f: impl Fn(&NodeStatus) -> bool) -> usize {
        self.states.values().filter(|s| f(s)).count()
    }
}

/// Node capability and dispatch settings, resolved once before scheduling.
struct ResolvedNode {
    node: Arc<dyn Node>,
    parameters: Arc<BTreeMap<String, Value>>,
    key: Option<BatchKey>,
    retry: RetryPolicy,
    timeout_ms: Option<u64>,
}

/// What a dispatch task hands back to the control loop.
struct TaskReport {
    outcome: RetryOutcome<Vec<Vec<Item>>>,
}

type TaskFuture = BoxFuture<'static, (u64, Result<TaskReport, JoinError>)>;

struct InFlight {
    group: BatchGroup,
    started_at: DateTime<Utc>,
    abort: AbortHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    Aborted,
}

/// Mutable state of one run. Only the control loop touches it.
struct RunState {
    execution_id: ExecutionId,
    graph: Arc<Graph>,
    events: Arc<EventBus>,
    status: HashMap<NodeId, NodeStatus>,
    settled: HashSet<NodeId>,
    run_data: RunData,
    halt: Option<Halt>,
    fatal: Option<ErrorDescriptor>,
}

impl RunState {
    fn new(execution_id: ExecutionId, graph: Arc<Graph>, events: Arc<EventBus>) -> Self {
        let status = graph
            .nodes()
            .iter()
            .map(|n| (n.id, NodeStatus::Pending))
            .collect();
        Self {
            execution_id,
            graph,
            events,
            status,
            settled: HashSet::new(),
            run_data: RunData::new(),
            halt: None,
            fatal: None,
        }
    }

    fn status(&self, node_id: NodeId) -> NodeStatus {
        self.status
            .get(&node_id)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    fn transition(&mut self, node_id: NodeId, status: NodeStatus) {
        self.status.insert(node_id, status);
        if status.is_terminal() {
            self.settled.insert(node_id);
        }
        self.events.node_state(self.execution_id, node_id, status);
    }

    /// Skip every node that has not been dispatched yet.
    fn skip_undispatched(&mut self, reason: SkipReason) -> usize {
        let pending: Vec<NodeId> = self
            .graph
            .nodes()
            .iter()
            .map(|n| n.id)
            .filter(|&id| matches!(self.status(id), NodeStatus::Pending | NodeStatus::Ready))
            .collect();
        for &id in &pending {
            self.transition(id, NodeStatus::Skipped { reason });
        }
        pending.len()
    }
}

enum Admission {
    Ready(MergedInput),
    Skip,
}

/// Executes workflow graphs with parallel branches and batched dispatch
pub struct WorkflowExecutor {
    max_parallel: usize,
    retry: RetryPolicy,
    default_timeout_ms: Option<u64>,
    batching: bool,
}

impl WorkflowExecutor {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            max_parallel: config.max_parallel_dispatches.max(1),
            retry: config.retry.clone(),
            default_timeout_ms: config.default_timeout_ms,
            batching: config.batching,
        }
    }

    /// Run `graph` to completion, cancellation or abort.
    ///
    /// Errors are returned only when the run cannot start (unknown node
    /// type, invalid parameters). Node failures, cancellation and fatal
    /// aborts are reported inside the [`RunResult`].
    pub async fn execute(
        &self,
        graph: Arc<Graph>,
        registry: &NodeRegistry,
        events: Arc<EventBus>,
        initial_items: Vec<Item>,
        execution_id: ExecutionId,
        cancellation: CancellationToken,
    ) -> Result<RunResult, FlowError> {
        let start_time = Instant::now();
        graph.topological_order()?;
        let resolved = self.resolve_nodes(&graph, registry)?;

        events.emit(ExecutionEvent::RunStarted {
            execution_id,
            node_count: graph.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Starting run {} ({} nodes, {} connections)",
            execution_id,
            graph.len(),
            graph.edges().len()
        );

        let run = Arc::new(RunContext::new(execution_id));
        let state = RunState::new(execution_id, graph.clone(), events.clone());
        let result = self
            .run_loop(state, &resolved, run, initial_items, cancellation)
            .await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        tracing::info!(
            "Run {} ended after {}ms: {} succeeded, {} failed, {} skipped",
            execution_id,
            duration_ms,
            result.succeeded(),
            result.failed(),
            result.skipped()
        );
        events.emit(ExecutionEvent::RunCompleted {
            execution_id,
            finished: result.finished,
            duration_ms,
            timestamp: Utc::now(),
        });
        Ok(result)
    }

    fn resolve_nodes(
        &self,
        graph: &Graph,
        registry: &NodeRegistry,
    ) -> Result<HashMap<NodeId, ResolvedNode>, FlowError> {
        let mut resolved = HashMap::new();
        for spec in graph.nodes() {
            let node: Arc<dyn Node> =
                Arc::from(registry.create_node(&spec.node_type, &spec.parameters)?);
            let metadata = registry.get_metadata(&spec.node_type).unwrap_or_default();
            let key = metadata
                .batchable
                .then(|| batch::compute_key(spec, graph, &metadata.item_scoped_parameters));
            resolved.insert(
                spec.id,
                ResolvedNode {
                    node,
                    parameters: Arc::new(spec.parameters.clone()),
                    key,
                    retry: spec.retry_policy.clone().unwrap_or_else(|| self.retry.clone()),
                    timeout_ms: spec.timeout_ms.or(self.default_timeout_ms),
                },
            );
        }
        Ok(resolved)
    }

    async fn run_loop(
        &self,
        mut state: RunState,
        resolved: &HashMap<NodeId, ResolvedNode>,
        run: Arc<RunContext>,
        initial_items: Vec<Item>,
        cancellation: CancellationToken,
    ) -> RunResult {
        // In-flight tasks observe this token; it is raised on cancel or abort.
        let task_token = cancellation.child_token();
        let mut running: FuturesUnordered<TaskFuture> = FuturesUnordered::new();
        let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
        let mut ready: Vec<ReadyNode> = Vec::new();
        let mut next_seq = 0u64;

        loop {
            // A cancel raised while a completion was being applied must win
            // over admitting the nodes that completion unlocked.
            if state.halt.is_none() && cancellation.is_cancelled() {
                halt_for_cancellation(&mut state, &mut ready, in_flight.len(), &task_token);
            }

            if state.halt.is_none() {
                self.admit(&mut state, resolved, &initial_items, &mut ready);

                let groups = batch::group(std::mem::take(&mut ready), self.batching);
                for group in groups {
                    if running.len() >= self.max_parallel {
                        ready.extend(group.members);
                        continue;
                    }
                    let seq = next_seq;
                    next_seq += 1;
                    let (task, abort) =
                        self.spawn_group(&mut state, resolved, &group, seq, &run, &task_token);
                    running.push(task);
                    in_flight.insert(
                        seq,
                        InFlight {
                            group,
                            started_at: Utc::now(),
                            abort,
                        },
                    );
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancellation.cancelled(), if state.halt.is_none() => {
                    halt_for_cancellation(&mut state, &mut ready, in_flight.len(), &task_token);
                }
                Some((seq, joined)) = running.next() => {
                    let Some(flight) = in_flight.remove(&seq) else {
                        continue;
                    };
                    let report = match joined {
                        Ok(report) => report,
                        Err(join_error) => TaskReport {
                            outcome: RetryOutcome {
                                result: Err(NodeError::ExecutionFailed(format!(
                                    "dispatch task failed: {}",
                                    join_error
                                ))),
                                attempt: 1,
                                failed_attempts: Vec::new(),
                                started_at: flight.started_at,
                                finished_at: Utc::now(),
                            },
                        },
                    };
                    self.complete(&mut state, flight.group, report);

                    if state.fatal.is_some() && state.halt != Some(Halt::Aborted) {
                        state.halt = Some(Halt::Aborted);
                        task_token.cancel();
                        self.abort_in_flight(&mut state, &mut in_flight);
                        break;
                    }
                }
            }
        }

        // Every node must be settled once nothing is in flight.
        let stalled: Vec<NodeId> = state
            .graph
            .nodes()
            .iter()
            .map(|n| n.id)
            .filter(|id| !state.settled.contains(id))
            .collect();
        if !stalled.is_empty() {
            tracing::error!("Scheduler stalled with {} unsettled node(s)", stalled.len());
            if state.fatal.is_none() {
                state.fatal = Some(ErrorDescriptor::new(
                    format!("scheduler stalled with {} unsettled node(s)", stalled.len()),
                    FailureClass::Fatal,
                ));
            }
            state.halt = Some(Halt::Aborted);
            state.skip_undispatched(SkipReason::Aborted);
        }

        self.finish(state, run)
    }

    /// Move every pending node whose producers are all settled to READY or
    /// SKIPPED, repeating until no more nodes change state.
    fn admit(
        &self,
        state: &mut RunState,
        resolved: &HashMap<NodeId, ResolvedNode>,
        initial_items: &[Item],
        ready: &mut Vec<ReadyNode>,
    ) {
        loop {
            let candidates: Vec<NodeId> = state
                .graph
                .ready_nodes(&state.settled)
                .into_iter()
                .filter(|&id| state.status(id) == NodeStatus::Pending)
                .collect();
            if candidates.is_empty() {
                break;
            }

            let mut skipped_any = false;
            for node_id in candidates {
                match admission(state, node_id, initial_items) {
                    Admission::Skip => {
                        tracing::info!("Skipping node {}: no live input", node_id);
                        state.transition(
                            node_id,
                            NodeStatus::Skipped {
                                reason: SkipReason::UpstreamFailed,
                            },
                        );
                        skipped_any = true;
                    }
                    Admission::Ready(input) => {
                        let Some(spec) = state.graph.node(node_id) else {
                            continue;
                        };
                        // Nothing to coalesce for a node without input.
                        let key = resolved
                            .get(&node_id)
                            .and_then(|r| r.key)
                            .filter(|_| !input.is_empty());
                        let node = ReadyNode {
                            node_id,
                            key,
                            shape: spec.inputs.iter().map(|p| p.name.clone()).collect(),
                            mode: spec.mode,
                            input,
                        };
                        tracing::debug!(
                            "Node {} ready with {} item(s)",
                            node_id,
                            node.input.len()
                        );
                        state.transition(node_id, NodeStatus::Ready);
                        ready.push(node);
                    }
                }
            }

            // Newly skipped nodes may settle further candidates; ready nodes
            // do not, so stop once a pass skipped nothing.
            if !skipped_any {
                break;
            }
        }
        let graph = state.graph.clone();
        ready.sort_by_key(|n| graph.definition_order(n.node_id));
    }

    fn spawn_group(
        &self,
        state: &mut RunState,
        resolved: &HashMap<NodeId, ResolvedNode>,
        group: &BatchGroup,
        seq: u64,
        run: &Arc<RunContext>,
        token: &CancellationToken,
    ) -> (TaskFuture, AbortHandle) {
        let leader = group.members[0].node_id;
        let resolved_leader = &resolved[&leader];
        let output_count = state.graph.node(leader).map_or(1, |s| s.outputs.len());

        for member in &group.members {
            state.transition(member.node_id, NodeStatus::Dispatched);
        }
        tracing::info!(
            "Dispatching {} ({} node(s), {} item(s), mode {:?})",
            leader,
            group.members.len(),
            group.total_items(),
            group.effective_mode()
        );

        let request = DispatchRequest {
            node_id: leader,
            node: resolved_leader.node.clone(),
            parameters: resolved_leader.parameters.clone(),
            mode: group.effective_mode(),
            items: group.concatenated_items(),
            output_count,
            timeout_ms: resolved_leader.timeout_ms,
            run: run.clone(),
            events: state.events.create_emitter(state.execution_id, leader),
            cancellation: token.clone(),
        };
        let policy = resolved_leader.retry.clone();
        let events = state.events.clone();
        let execution_id = state.execution_id;
        let cancellation = token.clone();

        let handle = tokio::spawn(async move {
            let outcome = retry::execute_with_retry(
                &policy,
                leader,
                &cancellation,
                |event| {
                    events.emit(ExecutionEvent::AttemptFailed {
                        execution_id,
                        node_id: leader,
                        attempt: event.attempt,
                        error: event.error.clone(),
                        retry_in_ms: event.retry_delay_ms,
                        timestamp: Utc::now(),
                    })
                },
                |attempt| request.attempt(attempt),
            )
            .await;
            TaskReport { outcome }
        });
        let abort = handle.abort_handle();
        let task: TaskFuture = Box::pin(async move { (seq, handle.await) });
        (task, abort)
    }

    /// Apply a finished dispatch to the run state.
    fn complete(&self, state: &mut RunState, group: BatchGroup, report: TaskReport) {
        let TaskReport { outcome, .. } = report;
        let mode = group.effective_mode();
        let batch_info = group.is_batched().then(|| BatchInfo {
            key: group.key.map_or(0, |k| k.0),
            members: group.member_ids(),
            total_items: group.total_items(),
        });

        let exhausted = outcome.exhausted();
        let result = match outcome.result {
            Ok(outputs) if group.is_batched() => {
                batch::demux(outputs, &group.member_sizes()).map_err(|e| (e, false))
            }
            Ok(outputs) => Ok(vec![outputs]),
            Err(error) => Err((error, exhausted)),
        };

        match result {
            Ok(per_member) => {
                for (member, outputs) in group.members.into_iter().zip(per_member) {
                    let produced: usize = outputs.iter().map(Vec::len).sum();
                    tracing::info!(
                        "Node {} succeeded on attempt {} ({} item(s) in, {} out)",
                        member.node_id,
                        outcome.attempt,
                        member.input.len(),
                        produced
                    );
                    let record = ExecutionRecord {
                        started_at: outcome.started_at,
                        finished_at: outcome.finished_at,
                        mode,
                        input_count: member.input.len(),
                        attempt: outcome.attempt,
                        failed_attempts: outcome.failed_attempts.clone(),
                        input_origins: member.input.origins,
                        warnings: member.input.warnings,
                        batch: batch_info.clone(),
                        outcome: Outcome::Success { outputs },
                    };
                    state.run_data.push(member.node_id, record);
                    state.transition(member.node_id, NodeStatus::Succeeded);
                }
            }
            Err((error, exhausted)) => {
                for member in group.members {
                    let descriptor = if exhausted {
                        ErrorDescriptor::exhausted(member.node_id, &error, outcome.attempt)
                    } else {
                        ErrorDescriptor::from_node_error(member.node_id, &error)
                    };
                    tracing::error!("Node {} failed: {}", member.node_id, descriptor.message);

                    if descriptor.class == FailureClass::Fatal && state.fatal.is_none() {
                        state.fatal = Some(descriptor.clone());
                    }

                    let record = ExecutionRecord {
                        started_at: outcome.started_at,
                        finished_at: outcome.finished_at,
                        mode,
                        input_count: member.input.len(),
                        attempt: outcome.attempt,
                        failed_attempts: outcome.failed_attempts.clone(),
                        input_origins: member.input.origins,
                        warnings: member.input.warnings,
                        batch: batch_info.clone(),
                        outcome: Outcome::Failure { error: descriptor },
                    };
                    state.run_data.push(member.node_id, record);
                    state.transition(member.node_id, NodeStatus::Failed);
                }
            }
        }
    }

    /// Stop every in-flight task after a fatal failure. Their nodes were
    /// dispatched, so they still get a failure record.
    fn abort_in_flight(&self, state: &mut RunState, in_flight: &mut HashMap<u64, InFlight>) {
        let mut flights: Vec<InFlight> = in_flight.drain().map(|(_, f)| f).collect();
        flights.sort_by_key(|f| state.graph.definition_order(f.group.members[0].node_id));
        for flight in flights {
            flight.abort.abort();
            let mode = flight.group.effective_mode();
            for member in flight.group.members {
                let mut error =
                    ErrorDescriptor::new("aborted by a fatal failure", FailureClass::Permanent);
                error.node_id = Some(member.node_id);
                let record = ExecutionRecord {
                    started_at: flight.started_at,
                    finished_at: Utc::now(),
                    mode,
                    input_count: member.input.len(),
                    attempt: 1,
                    failed_attempts: Vec::new(),
                    input_origins: member.input.origins,
                    warnings: member.input.warnings,
                    batch: None,
                    outcome: Outcome::Failure { error },
                };
                state.run_data.push(member.node_id, record);
                state.transition(member.node_id, NodeStatus::Failed);
            }
        }
        let skipped = state.skip_undispatched(SkipReason::Aborted);
        tracing::error!("Run {} aborted; {} node(s) skipped", state.execution_id, skipped);
    }

    fn finish(&self, state: RunState, run: Arc<RunContext>) -> RunResult {
        tracing::debug!(
            "Run {} made {} dispatch attempt(s), {} capability call(s)",
            state.execution_id,
            run.dispatches(),
            run.invocations()
        );

        let error = match state.halt {
            Some(Halt::Aborted) => state.fatal.clone(),
            Some(Halt::Cancelled) => Some(ErrorDescriptor::cancelled()),
            None => state
                .graph
                .nodes()
                .iter()
                .filter(|spec| state.status(spec.id) == NodeStatus::Failed)
                .find(|spec| !state.graph.outgoing(spec.id).any(|c| c.error_tolerant))
                .and_then(|spec| state.run_data.latest(spec.id))
                .and_then(|record| record.error().cloned()),
        };

        RunResult {
            execution_id: state.execution_id,
            finished: state.halt.is_none(),
            run_data: state.run_data,
            error,
            states: state.status,
        }
    }
}

/// Stop admitting work: skip every undispatched node, drop the ready stash
/// and raise the token in-flight tasks observe.
fn halt_for_cancellation(
    state: &mut RunState,
    ready: &mut Vec<ReadyNode>,
    in_flight: usize,
    task_token: &CancellationToken,
) {
    let skipped = state.skip_undispatched(SkipReason::Cancelled);
    ready.clear();
    tracing::info!(
        "Run {} cancelled: {} node(s) skipped, waiting for {} in-flight dispatch(es)",
        state.execution_id,
        skipped,
        in_flight
    );
    state.halt = Some(Halt::Cancelled);
    task_token.cancel();
}

/// Decide whether a node whose producers are all settled runs or is skipped,
/// and assemble its input.
fn admission(state: &RunState, node_id: NodeId, initial_items: &[Item]) -> Admission {
    let graph = &state.graph;
    let Some(spec) = graph.node(node_id) else {
        return Admission::Skip;
    };

    if graph.is_source(node_id) {
        let mut port = PortInput::default();
        for item in initial_items {
            port.push(item.clone(), None);
        }
        let mut ports = vec![port];
        ports.resize_with(spec.inputs.len().max(1), PortInput::default);
        return Admission::Ready(merge::merge(spec.merge, ports));
    }

    let mut ports = Vec::with_capacity(spec.inputs.len());
    let mut any_live = false;
    for (declared, connections) in spec.inputs.iter().zip(graph.port_sources(node_id)) {
        let mut port = PortInput::default();
        let mut live = false;
        for conn in &connections {
            match state.status(conn.from_node) {
                NodeStatus::Succeeded => {
                    live = true;
                    let output = graph
                        .node(conn.from_node)
                        .and_then(|s| s.output_index(&conn.from_port))
                        .unwrap_or(0);
                    let items = state
                        .run_data
                        .output_items(conn.from_node, output)
                        .unwrap_or(&[]);
                    for (index, item) in items.iter().enumerate() {
                        port.push(
                            item.clone(),
                            Some(ItemRef {
                                node_id: conn.from_node,
                                output,
                                item: index,
                            }),
                        );
                    }
                }
                NodeStatus::Failed if conn.error_tolerant => live = true,
                _ => {}
            }
        }

        if !connections.is_empty() && !live && declared.required {
            return Admission::Skip;
        }
        any_live |= live;
        ports.push(port);
    }

    if !any_live {
        return Admission::Skip;
    }
    Admission::Ready(merge::merge(spec.merge, ports))
}
