use async_trait::async_trait;
use latticecore::{Node, NodeContext, NodeError, NodeOutput, Value};
use latticeruntime::{NodeFactory, NodeMetadata};
use std::collections::BTreeMap;

/// Fails its first `times` attempts with the configured class, then passes
/// items through. Useful for exercising retry and error routing.
pub struct FaultNode {
    class: FaultClass,
    times: u32,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultClass {
    Transient,
    Permanent,
    Fatal,
}

impl FaultNode {
    fn from_parameters(parameters: &BTreeMap<String, Value>) -> Result<Self, NodeError> {
        let class = match parameters.get("class").and_then(|v| v.as_str()).unwrap_or("permanent") {
            "transient" => FaultClass::Transient,
            "permanent" => FaultClass::Permanent,
            "fatal" => FaultClass::Fatal,
            other => {
                return Err(NodeError::Configuration(format!(
                    "unknown failure class '{}'",
                    other
                )))
            }
        };
        let times = parameters
            .get("times")
            .and_then(|v| v.as_f64())
            .map_or(u32::MAX, |n| n as u32);
        let message = parameters
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("injected failure")
            .to_string();
        Ok(Self {
            class,
            times,
            message,
        })
    }
}

#[async_trait]
impl Node for FaultNode {
    fn node_type(&self) -> &str {
        "debug.fail"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if ctx.attempt > self.times {
            return Ok(NodeOutput::single(ctx.items));
        }
        ctx.events
            .warn(format!("Failing attempt {}: {}", ctx.attempt, self.message));
        Err(match self.class {
            FaultClass::Transient => NodeError::Transient(self.message.clone()),
            FaultClass::Permanent => NodeError::ExecutionFailed(self.message.clone()),
            FaultClass::Fatal => NodeError::Fatal(self.message.clone()),
        })
    }
}

pub struct FaultNodeFactory;

impl NodeFactory for FaultNodeFactory {
    fn create(&self, parameters: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(FaultNode::from_parameters(parameters)?))
    }

    fn node_type(&self) -> &str {
        "debug.fail"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Fail a number of attempts with a chosen failure class".to_string(),
            category: "debug".to_string(),
            ..NodeMetadata::default()
        }
    }
}
