//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod fault;
mod store;
mod time;
mod transform;

pub use debug::DebugNode;
pub use fault::FaultNode;
pub use store::StoreAppendNode;
pub use time::DelayNode;
pub use transform::SetFieldsNode;
use latticeruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(fault::FaultNodeFactory));
    registry.register(Arc::new(store::StoreAppendNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
    registry.register(Arc::new(transform::SetFieldsNodeFactory));
}
