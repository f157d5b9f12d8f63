//! Core abstractions for the lattice engine
//!
//! This crate provides the graph model, the item and run-data model, the node
//! capability trait and the error taxonomy. It performs no scheduling.

mod error;
pub mod events;
mod graph;
mod item;
mod node;
mod run_data;
mod store;
mod value;
mod workflow;

pub use error::{ErrorDescriptor, FailureClass, FlowError, GraphError, NodeError};
pub use events::*;
pub use graph::Graph;
pub use item::{BinaryRef, Item, ItemRef, PairedItem};
pub use node::{Node, NodeContext, NodeOutput, RunContext};
pub use run_data::{
    AttemptEvent, BatchInfo, ExecutionRecord, NodeStatus, Outcome, RunData, RunWarning,
    SkipReason,
};
pub use store::{ExecutionStore, StoreEntry};
pub use value::Value;
pub use workflow::{
    Connection, ExecutionMode, InputPort, MergeMode, NodeId, NodeSpec, Position, RetryPolicy,
    Workflow, WorkflowId, MAIN_PORT,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
