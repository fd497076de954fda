mod binding;
mod builder;
mod context;
mod definition;
mod graph;
mod read;
mod status;
mod step;

pub use binding::{Binding, Data};
pub use builder::{WorkflowBuilder, WorkflowResponse, NODE_PATH_SEPARATOR};
pub use context::{ExecutionContext, StepContext};
pub use definition::{WorkflowDefinition, WorkflowHandle, WorkflowInfo};
pub use graph::{GraphDescription, Node, NodeDescription, NodeKind, Stage, TransformFn, WorkflowGraph};
pub use read::{shape_result, EntityReader, ReadOptions, ReadRequest, ReadStep};
pub use status::RunStatus;
pub use step::{
    BackoffStrategy, BoxFuture, RetryPolicy, StepDefinition, StepHandle, StepKind, StepOutput,
    StepResponse, StepStatus,
};
