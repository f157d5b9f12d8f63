use async_trait::async_trait;
use latticecore::{Node, NodeContext, NodeError, NodeOutput, Value};
use latticeruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;

/// Logs its items and passes them through unchanged
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let label = ctx
            .parameters
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("debug");

        ctx.events
            .info(format!("{}: {} item(s)", label, ctx.items.len()));
        for (index, item) in ctx.items.iter().enumerate() {
            tracing::debug!("[{}] item {}: {:?}", label, index, item.fields);
        }

        let items = ctx
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| item.clone().paired_with(index))
            .collect();
        Ok(NodeOutput::single(items))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _parameters: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs items and passes them through".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::new("main", "Items to log")],
            outputs: vec![PortDefinition::new("main", "The same items")],
            batchable: true,
            item_scoped_parameters: Vec::new(),
        }
    }
}
