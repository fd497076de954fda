pub mod config;
pub mod error;
pub mod workflow;

#[cfg(feature = "testing")]
pub mod testing;

pub use config::{Durability, EngineConfig, ExecutionConfig, RecoveryPolicy};
pub use error::{CompensationError, ErrorKind, FlowError, Result, StepError, StepFailure};
pub use workflow::{
    Data, EntityReader, ExecutionContext, ReadOptions, ReadRequest, ReadStep, RetryPolicy,
    RunStatus, StepContext, StepDefinition, StepHandle, StepResponse, WorkflowBuilder,
    WorkflowDefinition, WorkflowHandle, WorkflowInfo, WorkflowResponse,
};
