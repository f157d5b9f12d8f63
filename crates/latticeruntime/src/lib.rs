//! Workflow execution runtime
//!
//! This crate provides the scheduler that runs workflow graphs: parallel
//! branch dispatch, coalescing of identical node invocations, multi-input
//! merging and the retry policy, plus the node registry and runtime facade.

pub mod batch;
mod dispatch;
mod executor;
pub mod merge;
mod registry;
pub mod retry;
mod runtime;

pub use batch::{BatchGroup, BatchKey};
pub use executor::{RunResult, WorkflowExecutor};
pub use merge::{MergedInput, PortInput};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use retry::{backoff_delay, execute_with_retry, RetryOutcome};
pub use runtime::{ExecutionHandle, FlowRuntime, RuntimeConfig};
