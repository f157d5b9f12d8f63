use async_trait::async_trait;
use latticecore::{Node, NodeContext, NodeError, NodeOutput, Value};
use latticeruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;

/// Set fields on every item
pub struct SetFieldsNode;

fn fields_parameter(parameters: &BTreeMap<String, Value>) -> Result<&BTreeMap<String, Value>, NodeError> {
    match parameters.get("fields") {
        Some(Value::Object(fields)) => Ok(fields),
        Some(_) => Err(NodeError::InvalidInputType {
            field: "fields".to_string(),
            expected: "object".to_string(),
            actual: "other".to_string(),
        }),
        None => Err(NodeError::Configuration("Missing parameter: fields".to_string())),
    }
}

#[async_trait]
impl Node for SetFieldsNode {
    fn node_type(&self) -> &str {
        "transform.set"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let fields = fields_parameter(&ctx.parameters)?;
        let keep_only_set = ctx
            .parameters
            .get("keep_only_set")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let items = ctx
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let mut out = if keep_only_set {
                    latticecore::Item::new()
                } else {
                    item.clone()
                };
                out.fields
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                out.paired_with(index)
            })
            .collect();

        Ok(NodeOutput::single(items))
    }

    fn validate_parameters(&self, parameters: &BTreeMap<String, Value>) -> Result<(), NodeError> {
        fields_parameter(parameters).map(|_| ())
    }
}

pub struct SetFieldsNodeFactory;

impl NodeFactory for SetFieldsNodeFactory {
    fn create(&self, _parameters: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(SetFieldsNode))
    }

    fn node_type(&self) -> &str {
        "transform.set"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Set fields on every item".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::new("main", "Items to update")],
            outputs: vec![PortDefinition::new("main", "Updated items")],
            batchable: true,
            item_scoped_parameters: Vec::new(),
        }
    }
}
