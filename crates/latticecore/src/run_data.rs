//! Per-node execution history accumulated during a run.

use crate::{ErrorDescriptor, ExecutionMode, Item, ItemRef, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Dispatched,
    Succeeded,
    Failed,
    Skipped { reason: SkipReason },
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Every producer feeding the node (or a mandatory port) failed or was
    /// skipped without an error-tolerant connection.
    UpstreamFailed,
    Cancelled,
    /// A fatal failure elsewhere aborted the run.
    Aborted,
}

/// Non-fatal conditions attached to an execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// A pairwise merge left trailing items unconsumed.
    MergeLengthMismatch {
        port_lengths: Vec<usize>,
        combined: usize,
        unconsumed: usize,
    },
}

/// A failed attempt that was superseded by a later one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: ErrorDescriptor,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Output items indexed by output port.
    Success { outputs: Vec<Vec<Item>> },
    Failure { error: ErrorDescriptor },
}

/// Present on records produced by a coalesced dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub key: u64,
    pub members: Vec<NodeId>,
    pub total_items: usize,
}

/// Authoritative record of one node dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Mode the capability was actually invoked in; batched `each` nodes
    /// record `once`.
    pub mode: ExecutionMode,
    pub input_count: usize,
    /// Number of the attempt this record describes, starting at 1.
    pub attempt: u32,
    /// Earlier failed attempts, kept for diagnostics.
    #[serde(default)]
    pub failed_attempts: Vec<AttemptEvent>,
    /// For each input item, the upstream items it was built from. Empty for
    /// items handed to the run as initial input.
    #[serde(default)]
    pub input_origins: Vec<Vec<ItemRef>>,
    #[serde(default)]
    pub warnings: Vec<RunWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchInfo>,
    pub outcome: Outcome,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn outputs(&self) -> Option<&[Vec<Item>]> {
        match &self.outcome {
            Outcome::Success { outputs } => Some(outputs),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { error } => Some(error),
        }
    }

    /// Total dispatches made for this record, failed ones included.
    pub fn total_attempts(&self) -> usize {
        self.failed_attempts.len() + 1
    }
}

/// Node id to ordered execution records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    records: HashMap<NodeId, Vec<ExecutionRecord>>,
}

impl RunData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node_id: NodeId, record: ExecutionRecord) {
        self.records.entry(node_id).or_default().push(record);
    }

    pub fn records(&self, node_id: NodeId) -> &[ExecutionRecord] {
        self.records.get(&node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest(&self, node_id: NodeId) -> Option<&ExecutionRecord> {
        self.records.get(&node_id).and_then(|records| records.last())
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.records.contains_key(&node_id)
    }

    /// Items on output port `output` of the latest successful record.
    pub fn output_items(&self, node_id: NodeId, output: usize) -> Option<&[Item]> {
        self.latest(node_id)
            .and_then(|record| record.outputs())
            .and_then(|outputs| outputs.get(output))
            .map(Vec::as_slice)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Trace an emitted item back to the items at the start of its branch.
    ///
    /// Returns the root item references, i.e. items of nodes that received
    /// initial input (or produced items without pairing information). The
    /// walk follows every pairing descriptor, so a pairwise-merged item
    /// yields one root per branch.
    pub fn lineage(&self, start: ItemRef) -> Vec<ItemRef> {
        let mut roots = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![start];

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(record) = self.latest(current.node_id) else {
                roots.push(current);
                continue;
            };
            let Some(item) = record
                .outputs()
                .and_then(|outputs| outputs.get(current.output))
                .and_then(|items| items.get(current.item))
            else {
                roots.push(current);
                continue;
            };

            let parents: Vec<ItemRef> = item
                .paired_item
                .iter()
                .filter_map(|paired| record.input_origins.get(paired.item))
                .flatten()
                .copied()
                .collect();
            if parents.is_empty() {
                roots.push(current);
            } else {
                stack.extend(parents.into_iter().rev());
            }
        }
        roots
    }
}
