use crate::{NodeId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pairing descriptor: which input item produced an item.
///
/// On a node's output, `item` indexes the flat input list the node received
/// and `input` names the input port that item arrived on. Items of the flat
/// input list carry their own position and port, so a capability that
/// passes items through unchanged reports correct pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairedItem {
    pub item: usize,
    #[serde(default)]
    pub input: usize,
}

impl PairedItem {
    pub fn new(item: usize) -> Self {
        Self { item, input: 0 }
    }

    pub fn on_input(item: usize, input: usize) -> Self {
        Self { item, input }
    }
}

/// Reference to a binary payload kept outside the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRef {
    pub id: String,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
}

/// The unit of data flowing along edges.
///
/// Items are immutable once emitted; downstream nodes always receive clones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<BinaryRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paired_item: Vec<PairedItem>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_binary(mut self, binary: BinaryRef) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Mark this item as produced from input item `index` (port 0).
    pub fn paired_with(mut self, index: usize) -> Self {
        self.paired_item = vec![PairedItem::new(index)];
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_paired(&self) -> bool {
        !self.paired_item.is_empty()
    }
}

impl From<serde_json::Value> for Item {
    /// Objects become the item's fields; any other JSON value is stored under
    /// the `value` field.
    fn from(json: serde_json::Value) -> Self {
        match Value::from(json) {
            Value::Object(fields) => Item {
                fields,
                ..Item::default()
            },
            other => Item::new().with_field("value", other),
        }
    }
}

/// Address of one emitted item inside a run: node, output port index and
/// position in that port's item list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub node_id: NodeId,
    pub output: usize,
    pub item: usize,
}
