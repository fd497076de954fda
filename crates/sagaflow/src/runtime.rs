//! sagaflow - saga-style workflow orchestration
//!
//! An [`Engine`] owns:
//! - the step and workflow registries
//! - the injected entity reader used by read steps
//! - the run store and the executor that drives runs forward and back

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use sagaflow_core::config::{EngineConfig, StoreBackend, StoreConfig};
use sagaflow_core::error::{FlowError, Result};
use sagaflow_core::workflow::{
    Data, EntityReader, GraphDescription, ReadStep, RunStatus, StepDefinition, StepHandle,
    WorkflowBuilder, WorkflowDefinition, WorkflowHandle, WorkflowInfo, WorkflowResponse,
};
use sagaflow_runtime::workflow::{
    FileRunStore, InMemoryRunStore, RunFilter, RunOptions, RunOutcome, RunStore, StepRegistry,
    WorkflowExecutor, WorkflowRegistry, WorkflowRun,
};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{json, Value};
    pub use tokio_util::sync::CancellationToken;
    pub use uuid::Uuid;

    pub use sagaflow_core::config::{Durability, EngineConfig, RecoveryPolicy};
    pub use sagaflow_core::error::{
        CompensationError, ErrorKind, FlowError, Result, StepError, StepFailure,
    };
    pub use sagaflow_core::workflow::{
        BackoffStrategy, Data, EntityReader, ReadOptions, ReadRequest, ReadStep, RetryPolicy,
        RunStatus, StepContext, StepDefinition, StepHandle, StepResponse, WorkflowBuilder,
        WorkflowHandle, WorkflowInfo, WorkflowResponse,
    };
    pub use sagaflow_runtime::workflow::{RunFilter, RunOptions, WorkflowRun};

    pub use crate::{Engine, EngineBuilder, RunResult};
}

/// What a caller gets back from a run.
#[derive(Debug)]
pub struct RunResult<T = Value> {
    pub run_id: Uuid,
    /// `None` when the run was rejected before it started.
    pub status: Option<RunStatus>,
    pub result: Result<T>,
}

impl<T> RunResult<T> {
    fn rejected(run_id: Uuid, error: FlowError) -> Self {
        Self {
            run_id,
            status: None,
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

impl From<RunOutcome> for RunResult {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            run_id: outcome.run.id,
            status: Some(outcome.run.status),
            result: outcome.result,
        }
    }
}

/// Open the run store a [`StoreConfig`] describes.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn RunStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryRunStore::new())),
        StoreBackend::File => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| FlowError::Config("store.path is required for the file backend".into()))?;
            Ok(Arc::new(FileRunStore::open(path).await?))
        }
        #[cfg(feature = "postgres")]
        StoreBackend::Postgres => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| FlowError::Config("store.url is required for the postgres backend".into()))?;
            let store = sagaflow_runtime::workflow::PgRunStore::connect(url, config.pool_size).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreBackend::Postgres => Err(FlowError::Config(
            "the postgres backend requires the `postgres` feature".into(),
        )),
    }
}

/// The sagaflow engine.
pub struct Engine {
    config: EngineConfig,
    steps: StepRegistry,
    workflows: Arc<WorkflowRegistry>,
    reader: Option<Arc<dyn EntityReader>>,
    executor: Arc<WorkflowExecutor>,
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn step_registry(&self) -> &StepRegistry {
        &self.steps
    }

    pub fn workflow_registry(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        self.executor.store()
    }

    /// Register a step. Names are unique across the engine.
    pub fn define_step(&self, definition: StepDefinition) -> Result<StepHandle> {
        self.steps.register(definition)
    }

    /// Register a read step backed by the engine's entity reader.
    pub fn define_read_step(&self, read: ReadStep) -> Result<StepHandle> {
        let reader = self.reader.clone().ok_or_else(|| {
            FlowError::Definition(format!(
                "read step '{}' needs an entity reader; configure one with EngineBuilder::reader",
                read.name()
            ))
        })?;
        self.steps.register_handle(read.into_step(reader))
    }

    /// Plan and register a workflow.
    ///
    /// `f` runs once, now, against a placeholder for the run input.
    pub fn define_workflow<F>(&self, info: impl Into<WorkflowInfo>, f: F) -> Result<WorkflowHandle>
    where
        F: FnOnce(&mut WorkflowBuilder, Data) -> Result<WorkflowResponse>,
    {
        let definition = WorkflowDefinition::build(info.into(), self.reader.clone(), f)?;
        self.workflows.register(definition)
    }

    /// Run a workflow to completion.
    ///
    /// Dropping the returned future cancels the run; steps that already
    /// completed are still compensated.
    pub async fn run(&self, workflow: &WorkflowHandle, input: Value) -> RunResult {
        self.run_with(workflow, input, RunOptions::default()).await
    }

    pub async fn run_with(
        &self,
        workflow: &WorkflowHandle,
        input: Value,
        mut options: RunOptions,
    ) -> RunResult {
        let run_id = *options.run_id.get_or_insert_with(Uuid::new_v4);
        match self.executor.start(workflow, input, options).await {
            Ok(outcome) => outcome.into(),
            Err(e) => RunResult::rejected(run_id, e),
        }
    }

    /// Run a registered workflow by name.
    pub async fn run_named(&self, name: &str, input: Value) -> RunResult {
        match self.workflows.get(name) {
            Some(workflow) => self.run(&workflow, input).await,
            None => RunResult::rejected(
                Uuid::new_v4(),
                FlowError::UnknownWorkflow(name.to_string()),
            ),
        }
    }

    /// Run with typed input and output.
    pub async fn run_typed<I, O>(&self, workflow: &WorkflowHandle, input: &I) -> RunResult<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = match serde_json::to_value(input) {
            Ok(input) => input,
            Err(e) => {
                return RunResult::rejected(Uuid::new_v4(), FlowError::InvalidInput(e.to_string()))
            }
        };

        let RunResult {
            run_id,
            status,
            result,
        } = self.run(workflow, input).await;
        let result = result.and_then(|value| {
            serde_json::from_value(value).map_err(|e| {
                FlowError::Serialization(format!(
                    "response of '{}' does not match the requested type: {}",
                    workflow.name(),
                    e
                ))
            })
        });
        RunResult {
            run_id,
            status,
            result,
        }
    }

    /// Continue an interrupted run.
    pub async fn resume(&self, run_id: Uuid) -> RunResult {
        self.resume_with(run_id, RunOptions::default()).await
    }

    pub async fn resume_with(&self, run_id: Uuid, options: RunOptions) -> RunResult {
        match self.executor.resume(run_id, options).await {
            Ok(outcome) => outcome.into(),
            Err(e) => RunResult::rejected(run_id, e),
        }
    }

    /// Compensate an interrupted run.
    pub async fn rollback(&self, run_id: Uuid) -> RunResult {
        match self.executor.rollback(run_id).await {
            Ok(outcome) => outcome.into(),
            Err(e) => RunResult::rejected(run_id, e),
        }
    }

    /// Apply the configured recovery policy to every interrupted run.
    pub async fn recover_incomplete(&self) -> Result<Vec<RunResult>> {
        let outcomes = self.executor.recover_incomplete().await?;
        Ok(outcomes.into_iter().map(RunResult::from).collect())
    }

    pub async fn run_record(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        self.executor.run_record(run_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        self.executor.list_runs(filter).await
    }

    /// Graph of a registered workflow.
    pub fn describe(&self, name: &str) -> Result<GraphDescription> {
        self.workflows
            .get(name)
            .map(|w| w.describe())
            .ok_or_else(|| FlowError::UnknownWorkflow(name.to_string()))
    }
}

/// Builder for configuring the engine.
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    reader: Option<Arc<dyn EntityReader>>,
    store: Option<Arc<dyn RunStore>>,
}

impl EngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration. Defaults to [`EngineConfig::default`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the entity reader used by read steps.
    pub fn reader(mut self, reader: impl EntityReader) -> Self {
        self.reader = Some(Arc::new(reader));
        self
    }

    pub fn shared_reader(mut self, reader: Arc<dyn EntityReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Use this store instead of the one the configuration names.
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the engine, opening the configured store.
    pub async fn build(self) -> Result<Engine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.store).await?,
        };

        let workflows = Arc::new(WorkflowRegistry::new());
        let executor = Arc::new(WorkflowExecutor::new(
            workflows.clone(),
            store,
            config.engine.clone(),
        ));

        tracing::debug!(
            durability = ?config.engine.durability,
            backend = ?config.store.backend,
            "Engine built"
        );

        Ok(Engine {
            config,
            steps: StepRegistry::new(),
            workflows,
            reader: self.reader,
            executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::config::{Durability, ExecutionConfig};
    use sagaflow_core::testing::MockReader;
    use sagaflow_core::ErrorKind;
    use serde::Deserialize;
    use serde_json::json;

    async fn engine() -> Engine {
        Engine::builder().build().await.unwrap()
    }

    #[tokio::test]
    async fn test_default_engine_is_ephemeral() {
        let engine = engine().await;
        assert_eq!(engine.config().engine.durability, Durability::Ephemeral);
        assert!(engine.step_registry().is_empty());
        assert!(engine.workflow_registry().is_empty());
    }

    #[tokio::test]
    async fn test_read_step_requires_reader() {
        let engine = engine().await;
        let err = engine.define_read_step(ReadStep::new("customer")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Definition);

        let engine = Engine::builder()
            .reader(MockReader::new())
            .build()
            .await
            .unwrap();
        let handle = engine.define_read_step(ReadStep::new("customer")).unwrap();
        assert_eq!(handle.name(), "read-customer");
        assert!(!handle.is_compensable());
    }

    #[tokio::test]
    async fn test_duplicate_definitions_fail_fast() {
        let engine = engine().await;
        let echo = || StepDefinition::new("echo", |v: Value, _ctx| async move { Ok(v) });
        engine.define_step(echo()).unwrap();
        assert!(matches!(
            engine.define_step(echo()),
            Err(FlowError::DuplicateStep(_))
        ));

        engine
            .define_workflow("flow", |_, input| Ok(WorkflowResponse::new(input)))
            .unwrap();
        assert!(matches!(
            engine.define_workflow("flow", |_, input| Ok(WorkflowResponse::new(input))),
            Err(FlowError::DuplicateWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_run_named_and_typed() {
        #[derive(Serialize)]
        struct Order {
            quantity: u32,
        }
        #[derive(Deserialize, Debug, PartialEq)]
        struct Total {
            total: u32,
        }

        let engine = engine().await;
        let price = engine
            .define_step(StepDefinition::new(
                "price",
                |order: Value, _ctx| async move {
                    let quantity = order["quantity"].as_u64().unwrap_or(0);
                    Ok(json!({ "total": quantity * 3 }))
                },
            ))
            .unwrap();
        let workflow = engine
            .define_workflow("checkout", |b, input| {
                let total = b.step(&price, input)?;
                Ok(WorkflowResponse::new(total))
            })
            .unwrap();

        let named = engine.run_named("checkout", json!({"quantity": 2})).await;
        assert_eq!(named.status, Some(RunStatus::Succeeded));
        assert_eq!(named.into_result().unwrap(), json!({"total": 6}));

        let typed: RunResult<Total> = engine.run_typed(&workflow, &Order { quantity: 4 }).await;
        assert_eq!(typed.into_result().unwrap(), Total { total: 12 });

        let missing = engine.run_named("nope", json!({})).await;
        assert_eq!(missing.status, None);
        assert_eq!(missing.result.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_describe_registered_workflow() {
        let engine = engine().await;
        let echo = engine
            .define_step(StepDefinition::new("echo", |v: Value, _ctx| async move { Ok(v) }))
            .unwrap();
        engine
            .define_workflow("described", |b, input| {
                let first = b.step(&echo, input)?;
                let second = b.step_as("echo-again", &echo, first)?;
                Ok(WorkflowResponse::new(second))
            })
            .unwrap();

        let description = engine.describe("described").unwrap();
        assert_eq!(description.nodes.len(), 2);
        assert_eq!(description.nodes[1].depends_on, vec!["echo".to_string()]);
        assert!(engine.describe("missing").is_err());
    }

    #[tokio::test]
    async fn test_file_backend_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            engine: ExecutionConfig {
                durability: Durability::Durable,
                ..ExecutionConfig::default()
            },
            store: StoreConfig {
                backend: StoreBackend::File,
                path: Some(dir.path().join("runs")),
                ..StoreConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = Engine::builder().config(config).build().await.unwrap();
        let workflow = engine
            .define_workflow("noop", |_, input| Ok(WorkflowResponse::new(input)))
            .unwrap();

        let result = engine.run(&workflow, json!({"a": 1})).await;
        let record = engine.run_record(result.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.output, Some(json!({"a": 1})));
    }
}
