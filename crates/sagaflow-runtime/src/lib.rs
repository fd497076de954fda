pub mod observability;
pub mod workflow;

pub use observability::init_tracing;
pub use workflow::{
    FileRunStore, InMemoryRunStore, RunFilter, RunOptions, RunOutcome, RunStore, StepRegistry,
    WorkflowExecutor, WorkflowRegistry, WorkflowRun,
};

#[cfg(feature = "postgres")]
pub use workflow::PgRunStore;
