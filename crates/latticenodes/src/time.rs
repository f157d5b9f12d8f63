use async_trait::async_trait;
use latticecore::{Node, NodeContext, NodeError, NodeOutput, Value};
use latticeruntime::{NodeFactory, NodeMetadata};
use std::collections::BTreeMap;
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .parameters
            .get("delay_ms")
            .and_then(|v| v.as_f64())
            .unwrap_or(1000.0) as u64; // Default to 1 second if not specified

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {}
        }

        // Pass through the items
        Ok(NodeOutput::single(ctx.items))
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _parameters: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            ..NodeMetadata::default()
        }
    }
}
