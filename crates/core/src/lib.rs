// Core types and engine for sagaflow, a durable DAG workflow engine with saga compensation

pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod storage;
pub mod types;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use error::{
    CompensationError, DefinitionError, EngineError, EngineResult, PersistenceError,
    TaskExecutionError,
};
pub use events::{Event, EventType};
pub use retry::{Backoff, ErrorAction, RetryDecision, RetryManager, RetryPolicy};
pub use storage::StateStore;
pub use types::*;
pub use workflow::{TaskRuntime, WorkflowDag, WorkflowEngine};
