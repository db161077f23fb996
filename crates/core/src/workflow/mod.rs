pub mod compensation;
pub mod dag;
pub mod executor;
pub mod journal;
pub mod runtime;
pub mod state;
pub mod task_executor;

pub use compensation::CompensationEngine;
pub use dag::WorkflowDag;
pub use executor::WorkflowEngine;
pub use journal::Journal;
pub use runtime::TaskRuntime;
pub use state::{Applied, InstanceState};
pub use task_executor::TaskExecutor;
