mod executor;
#[cfg(feature = "postgres")]
mod pg_store;
mod registry;
mod state;
mod store;

pub use executor::{RunOptions, RunOutcome, WorkflowExecutor, RESPONSE_NODE};
#[cfg(feature = "postgres")]
pub use pg_store::PgRunStore;
pub use registry::{StepRegistry, WorkflowRegistry};
pub use state::{CompletedNode, StepRecord, WorkflowRun};
pub use store::{FileRunStore, InMemoryRunStore, RunFilter, RunStore};
