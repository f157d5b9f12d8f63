//! A single dispatch attempt: invoking a capability in `each` or `once` mode
//! under the per-node timeout.

use latticecore::{
    EventEmitter, ExecutionMode, Item, Node, NodeContext, NodeError, NodeId, PairedItem,
    RunContext, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Everything a task needs to run one dispatch; owned by the task.
pub struct DispatchRequest {
    pub node_id: NodeId,
    pub node: Arc<dyn Node>,
    pub parameters: Arc<BTreeMap<String, Value>>,
    pub mode: ExecutionMode,
    pub items: Vec<Item>,
    pub output_count: usize,
    pub timeout_ms: Option<u64>,
    pub run: Arc<RunContext>,
    pub events: EventEmitter,
    pub cancellation: CancellationToken,
}

impl DispatchRequest {
    /// Run one attempt. Returns items per output port with pairing
    /// descriptors indexing `self.items`.
    pub async fn attempt(&self, attempt: u32) -> Result<Vec<Vec<Item>>, NodeError> {
        if self.cancellation.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        self.run.record_dispatch();

        let work = async {
            match self.mode {
                ExecutionMode::Once => self.invoke_once(attempt).await,
                ExecutionMode::Each => self.invoke_each(attempt).await,
            }
        };

        match self.timeout_ms {
            Some(ms) => timeout(Duration::from_millis(ms), work)
                .await
                .unwrap_or(Err(NodeError::Timeout { ms })),
            None => work.await,
        }
    }

    async fn invoke_once(&self, attempt: u32) -> Result<Vec<Vec<Item>>, NodeError> {
        let output = self.call(self.items.clone(), attempt).await?;
        let mut ports = self.normalize_ports(output.ports)?;
        for items in &mut ports {
            stamp_unpaired(items, &self.items);
        }
        Ok(ports)
    }

    async fn invoke_each(&self, attempt: u32) -> Result<Vec<Vec<Item>>, NodeError> {
        let mut ports: Vec<Vec<Item>> = vec![Vec::new(); self.output_count];
        for (index, item) in self.items.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            let output = self.call(vec![item.clone()], attempt).await?;
            let produced = self.normalize_ports(output.ports)?;
            let origin = PairedItem::on_input(index, input_port_of(item));
            for (port, items) in produced.into_iter().enumerate() {
                ports[port].extend(items.into_iter().map(|mut out| {
                    out.paired_item = vec![origin];
                    out
                }));
            }
        }
        Ok(ports)
    }

    async fn call(&self, items: Vec<Item>, attempt: u32) -> Result<latticecore::NodeOutput, NodeError> {
        self.run.record_invocation();
        let ctx = NodeContext {
            node_id: self.node_id,
            items,
            parameters: self.parameters.clone(),
            attempt,
            run: self.run.clone(),
            events: self.events.clone(),
            cancellation: self.cancellation.clone(),
        };
        self.node.execute(ctx).await
    }

    fn normalize_ports(&self, mut ports: Vec<Vec<Item>>) -> Result<Vec<Vec<Item>>, NodeError> {
        if ports.len() > self.output_count {
            return Err(NodeError::ExecutionFailed(format!(
                "node produced {} output ports but declares {}",
                ports.len(),
                self.output_count
            )));
        }
        ports.resize_with(self.output_count, Vec::new);
        Ok(ports)
    }
}

/// Port a flat input item arrived on, as stamped by the merge step.
fn input_port_of(item: &Item) -> usize {
    item.paired_item.first().map_or(0, |p| p.input)
}

/// Fill in pairing for outputs the capability left unpaired: positionally
/// when the counts match, or to the only input item.
fn stamp_unpaired(outputs: &mut [Item], inputs: &[Item]) {
    if outputs.iter().all(Item::is_paired) {
        return;
    }
    let positional = outputs.len() == inputs.len();
    for (index, item) in outputs.iter_mut().enumerate() {
        if item.is_paired() {
            continue;
        }
        if positional {
            item.paired_item = vec![PairedItem::on_input(index, input_port_of(&inputs[index]))];
        } else if inputs.len() == 1 {
            item.paired_item = vec![PairedItem::on_input(0, input_port_of(&inputs[0]))];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_positionally_when_counts_match() {
        let inputs = vec![
            Item::new().paired_with(0),
            Item {
                paired_item: vec![PairedItem::on_input(0, 1)],
                ..Item::default()
            },
        ];
        let mut outputs = vec![Item::new(), Item::new()];
        stamp_unpaired(&mut outputs, &inputs);
        assert_eq!(outputs[0].paired_item, vec![PairedItem::on_input(0, 0)]);
        assert_eq!(outputs[1].paired_item, vec![PairedItem::on_input(1, 1)]);
    }

    #[test]
    fn stamps_single_input_fan_out() {
        let inputs = vec![Item::new().paired_with(0)];
        let mut outputs = vec![Item::new(), Item::new(), Item::new()];
        stamp_unpaired(&mut outputs, &inputs);
        assert!(outputs.iter().all(|i| i.paired_item == vec![PairedItem::new(0)]));
    }

    #[test]
    fn leaves_ambiguous_outputs_unpaired() {
        let inputs = vec![Item::new(), Item::new()];
        let mut outputs = vec![Item::new()];
        stamp_unpaired(&mut outputs, &inputs);
        assert!(!outputs[0].is_paired());
    }
}
