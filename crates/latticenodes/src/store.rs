use async_trait::async_trait;
use latticecore::{Node, NodeContext, NodeError, NodeOutput, Value};
use latticeruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;

/// Append item fields to an array in the run's execution store.
///
/// All items of one invocation are written in a single store update, so a
/// coalesced dispatch of several instances produces one write.
pub struct StoreAppendNode;

#[async_trait]
impl Node for StoreAppendNode {
    fn node_type(&self) -> &str {
        "store.append"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let key = ctx
            .require_parameter("key")?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "key".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?
            .to_string();
        let field = ctx.parameters.get("field").and_then(|v| v.as_str());

        let values: Vec<Value> = ctx
            .items
            .iter()
            .map(|item| match field {
                Some(name) => item.get(name).cloned().unwrap_or(Value::Null),
                None => Value::Object(item.fields.clone()),
            })
            .collect();

        let entry = ctx.store().append(key.clone(), values).await;
        ctx.events
            .info(format!("Store key '{}' at version {}", key, entry.version));

        let items = ctx
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item.clone()
                    .with_field("store_version", entry.version as i64)
                    .paired_with(index)
            })
            .collect();
        Ok(NodeOutput::single(items))
    }
}

pub struct StoreAppendNodeFactory;

impl NodeFactory for StoreAppendNodeFactory {
    fn create(&self, _parameters: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(StoreAppendNode))
    }

    fn node_type(&self) -> &str {
        "store.append"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Append items to a key in the execution store".to_string(),
            category: "store".to_string(),
            inputs: vec![PortDefinition::new("main", "Items to record")],
            outputs: vec![PortDefinition::new("main", "Items, tagged with the store version")],
            batchable: true,
            item_scoped_parameters: Vec::new(),
        }
    }
}
