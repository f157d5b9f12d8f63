//! Combining the per-port item lists of a node into one input sequence.
//!
//! Every item of the combined sequence is re-stamped with a pairing
//! descriptor holding its own position in the sequence and the port it
//! arrived on, and the upstream item it came from is kept alongside so
//! lineage survives fan-in.

use latticecore::{Item, ItemRef, MergeMode, PairedItem, RunWarning};

/// Items collected for one input port, in connection order.
#[derive(Debug, Clone, Default)]
pub struct PortInput {
    pub items: Vec<Item>,
    /// Upstream reference per item; `None` for initial run input.
    pub origins: Vec<Option<ItemRef>>,
}

impl PortInput {
    pub fn push(&mut self, item: Item, origin: Option<ItemRef>) {
        self.items.push(item);
        self.origins.push(origin);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The single ordered sequence handed to a node.
#[derive(Debug, Clone, Default)]
pub struct MergedInput {
    pub items: Vec<Item>,
    /// Upstream references per item, parallel to `items`.
    pub origins: Vec<Vec<ItemRef>>,
    pub warnings: Vec<RunWarning>,
}

impl MergedInput {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn merge(mode: MergeMode, ports: Vec<PortInput>) -> MergedInput {
    match mode {
        MergeMode::Pairwise if ports.len() > 1 => pairwise(ports),
        _ => append(ports),
    }
}

/// Concatenate all ports in declaration order.
fn append(ports: Vec<PortInput>) -> MergedInput {
    let mut merged = MergedInput::default();
    for (port_index, port) in ports.into_iter().enumerate() {
        for (mut item, origin) in port.items.into_iter().zip(port.origins) {
            item.paired_item = vec![PairedItem::on_input(merged.items.len(), port_index)];
            merged.items.push(item);
            merged.origins.push(origin.into_iter().collect());
        }
    }
    merged
}

/// Zip ports by position up to the shortest one. Later ports win on
/// conflicting field names.
fn pairwise(ports: Vec<PortInput>) -> MergedInput {
    let port_lengths: Vec<usize> = ports.iter().map(PortInput::len).collect();
    let combined = port_lengths.iter().copied().min().unwrap_or(0);
    let unconsumed: usize = port_lengths.iter().map(|len| len - combined).sum();

    let mut merged = MergedInput::default();
    for index in 0..combined {
        let mut item = Item::new();
        let mut origins = Vec::with_capacity(ports.len());
        for (port_index, port) in ports.iter().enumerate() {
            let source = &port.items[index];
            item.fields
                .extend(source.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            if item.binary.is_none() {
                item.binary = source.binary.clone();
            }
            item.paired_item.push(PairedItem::on_input(index, port_index));
            origins.extend(port.origins[index]);
        }
        merged.items.push(item);
        merged.origins.push(origins);
    }

    if unconsumed > 0 {
        tracing::warn!(
            "Pairwise merge of ports with lengths {:?} left {} item(s) unconsumed",
            port_lengths,
            unconsumed
        );
        merged.warnings.push(RunWarning::MergeLengthMismatch {
            port_lengths,
            combined,
            unconsumed,
        });
    }
    merged
}
