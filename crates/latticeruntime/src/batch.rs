//! Coalescing structurally identical node invocations.
//!
//! Nodes that become ready in the same scheduling pass and share a batching
//! key are dispatched as one `once`-mode call over the concatenation of
//! their inputs. The outputs are then split back per node using the pairing
//! descriptors, so every member still gets its own execution record.

use crate::merge::MergedInput;
use latticecore::{ExecutionMode, Graph, Item, NodeError, NodeId, NodeSpec};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey(pub u64);

/// Hash of node type, parameters (minus item-scoped ones), execution mode,
/// dispatch settings and the node's downstream port contracts.
///
/// Parameters are visited in sorted key order and values are hashed
/// canonically, so the key does not depend on how the bag was built.
pub fn compute_key(spec: &NodeSpec, graph: &Graph, item_scoped: &[String]) -> BatchKey {
    let mut hasher = DefaultHasher::new();
    spec.node_type.hash(&mut hasher);
    spec.mode.hash(&mut hasher);

    for (name, value) in &spec.parameters {
        if item_scoped.iter().any(|scoped| scoped == name) {
            continue;
        }
        name.hash(&mut hasher);
        value.hash_canonical(&mut hasher);
    }

    spec.outputs.hash(&mut hasher);
    let contracts: BTreeSet<(&str, bool)> = graph
        .outgoing(spec.id)
        .map(|conn| (conn.from_port.as_str(), conn.error_tolerant))
        .collect();
    contracts.hash(&mut hasher);

    spec.timeout_ms.hash(&mut hasher);
    match &spec.retry_policy {
        Some(policy) => {
            policy.max_attempts.hash(&mut hasher);
            policy.base_delay_ms.hash(&mut hasher);
            policy.backoff_multiplier.to_bits().hash(&mut hasher);
            policy.max_jitter_ms.hash(&mut hasher);
            policy.max_delay_ms.hash(&mut hasher);
        }
        None => 0u8.hash(&mut hasher),
    }

    BatchKey(hasher.finish())
}

/// A node that passed admission and waits for dispatch.
#[derive(Debug, Clone)]
pub struct ReadyNode {
    pub node_id: NodeId,
    /// `None` when the node type does not allow coalescing.
    pub key: Option<BatchKey>,
    /// Input port names; members of a group must agree on them.
    pub shape: Vec<String>,
    pub mode: ExecutionMode,
    pub input: MergedInput,
}

/// Ready nodes dispatched together.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub key: Option<BatchKey>,
    pub members: Vec<ReadyNode>,
}

impl BatchGroup {
    pub fn is_batched(&self) -> bool {
        self.members.len() > 1
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.node_id).collect()
    }

    /// Mode the capability is invoked in: the declared mode for a single
    /// member, `once` for a coalesced group.
    pub fn effective_mode(&self) -> ExecutionMode {
        if self.is_batched() {
            ExecutionMode::Once
        } else {
            self.members[0].mode
        }
    }

    pub fn total_items(&self) -> usize {
        self.members.iter().map(|m| m.input.len()).sum()
    }

    /// Inputs of every member, concatenated in member order, with pairing
    /// shifted to positions in the concatenated list.
    pub fn concatenated_items(&self) -> Vec<Item> {
        let mut items = Vec::with_capacity(self.total_items());
        for member in &self.members {
            let offset = items.len();
            items.extend(member.input.items.iter().cloned().map(|mut item| {
                for paired in &mut item.paired_item {
                    paired.item += offset;
                }
                item
            }));
        }
        items
    }

    pub fn member_sizes(&self) -> Vec<usize> {
        self.members.iter().map(|m| m.input.len()).collect()
    }
}

/// Partition ready nodes into dispatch groups.
///
/// Input order is preserved: groups appear in the order of their first
/// member, members in the order they were given. Nodes without a key always
/// form a group of their own.
pub fn group(ready: Vec<ReadyNode>, enabled: bool) -> Vec<BatchGroup> {
    let mut groups: Vec<BatchGroup> = Vec::new();
    let mut by_key: HashMap<(BatchKey, Vec<String>), usize> = HashMap::new();

    for node in ready {
        let slot = match (enabled, node.key) {
            (true, Some(key)) => Some((key, node.shape.clone())),
            _ => None,
        };
        match slot {
            Some(slot) => {
                if let Some(&index) = by_key.get(&slot) {
                    groups[index].members.push(node);
                } else {
                    by_key.insert(slot, groups.len());
                    groups.push(BatchGroup {
                        key: node.key,
                        members: vec![node],
                    });
                }
            }
            None => groups.push(BatchGroup {
                key: node.key,
                members: vec![node],
            }),
        }
    }

    for group in groups.iter().filter(|g| g.is_batched()) {
        tracing::debug!(
            "Coalescing {} nodes into one dispatch ({} items)",
            group.members.len(),
            group.total_items()
        );
    }
    groups
}

/// Split the output of a coalesced call back to its members.
///
/// `sizes[m]` is the number of items member `m` contributed. Every output
/// item must carry a pairing descriptor into the concatenated input; the
/// descriptor is rewritten to index the member's own input.
pub fn demux(outputs: Vec<Vec<Item>>, sizes: &[usize]) -> Result<Vec<Vec<Vec<Item>>>, NodeError> {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut total = 0;
    for size in sizes {
        offsets.push(total);
        total += size;
    }

    let port_count = outputs.len();
    let mut split: Vec<Vec<Vec<Item>>> = vec![vec![Vec::new(); port_count]; sizes.len()];

    for (port, items) in outputs.into_iter().enumerate() {
        for mut item in items {
            let first = item.paired_item.first().ok_or_else(|| {
                NodeError::ExecutionFailed(
                    "batched output item has no pairing descriptor".to_string(),
                )
            })?;
            if first.item >= total {
                return Err(NodeError::ExecutionFailed(format!(
                    "pairing index {} out of range for {} batched items",
                    first.item, total
                )));
            }
            // Last member whose offset is <= index; empty members share an
            // offset with their successor and are skipped over.
            let member = offsets.partition_point(|&offset| offset <= first.item) - 1;
            let range = offsets[member]..offsets[member] + sizes[member];
            for paired in &mut item.paired_item {
                if !range.contains(&paired.item) {
                    return Err(NodeError::ExecutionFailed(
                        "output item is paired with inputs of different batch members"
                            .to_string(),
                    ));
                }
                paired.item -= offsets[member];
            }
            split[member][port].push(item);
        }
    }
    Ok(split)
}
