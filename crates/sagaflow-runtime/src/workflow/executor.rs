use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;
use uuid::Uuid;

use sagaflow_core::config::{Durability, ExecutionConfig, RecoveryPolicy};
use sagaflow_core::workflow::{
    ExecutionContext, Node, NodeKind, RunStatus, StepContext, StepHandle, StepOutput,
    WorkflowHandle,
};
use sagaflow_core::{CompensationError, FlowError, Result, StepError, StepFailure};

use super::registry::WorkflowRegistry;
use super::state::WorkflowRun;
use super::store::{RunFilter, RunStore};

/// Node id reported when computing the workflow response fails.
pub const RESPONSE_NODE: &str = "$response";

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Caller-supplied run id. Starting an id that exists fails.
    pub run_id: Option<Uuid>,
    pub metadata: Map<String, Value>,
    /// Observed between stages; in-flight steps finish first.
    pub cancellation: Option<CancellationToken>,
    /// Overrides the workflow and engine deadline.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final state of a run plus what its caller sees.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: WorkflowRun,
    pub result: Result<Value>,
}

impl RunOutcome {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn into_result(self) -> Result<Value> {
        self.result
    }
}

/// Interruption sources checked between stages.
struct Signals {
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Signals {
    fn none() -> Self {
        Self {
            cancellation: None,
            deadline: None,
        }
    }

    fn interruption(&self) -> Option<StepError> {
        if self
            .cancellation
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
        {
            return Some(StepError::cancelled("workflow run was cancelled"));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(StepError::timeout("workflow deadline exceeded"))
            }
            _ => None,
        }
    }
}

/// Marks a run id as executing in this process until dropped.
struct RunGuard<'a> {
    active: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Result of running one node to completion or failure.
struct NodeRun {
    node: String,
    input: Value,
    result: std::result::Result<StepOutput, StepError>,
    attempts: u32,
    compensable: bool,
}

/// Executes workflow runs: forward stages, LIFO compensation, resume and
/// rollback of persisted runs.
pub struct WorkflowExecutor {
    workflows: Arc<WorkflowRegistry>,
    store: Arc<dyn RunStore>,
    config: ExecutionConfig,
    active: Mutex<HashSet<Uuid>>,
}

impl WorkflowExecutor {
    /// Create a new workflow executor.
    pub fn new(
        workflows: Arc<WorkflowRegistry>,
        store: Arc<dyn RunStore>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            workflows,
            store,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    fn durable(&self) -> bool {
        self.config.durability == Durability::Durable
    }

    fn acquire(&self, id: Uuid) -> Result<RunGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(id) {
            return Err(FlowError::InvalidState(format!(
                "workflow run {} is already executing",
                id
            )));
        }
        Ok(RunGuard {
            active: &self.active,
            id,
        })
    }

    fn signals(&self, workflow: &WorkflowHandle, options: &RunOptions) -> Signals {
        let timeout = options
            .timeout
            .or(workflow.info().timeout)
            .or(self.config.workflow_timeout());
        Signals {
            cancellation: options.cancellation.clone(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Start a new run and drive it to a terminal state.
    ///
    /// The run executes on its own task. Dropping the returned future
    /// cancels the run: the in-flight stage finishes, then completed steps
    /// are compensated.
    ///
    /// The outer error covers failures before the run exists (duplicate id,
    /// store unavailable); the run's own outcome is in [`RunOutcome::result`].
    pub async fn start(
        self: &Arc<Self>,
        workflow: &WorkflowHandle,
        input: Value,
        mut options: RunOptions,
    ) -> Result<RunOutcome> {
        let _abandon = cancel_on_drop(&mut options);
        let executor = Arc::clone(self);
        let workflow = workflow.clone();
        detach(async move { executor.start_run(&workflow, input, options).await }).await
    }

    async fn start_run(
        &self,
        workflow: &WorkflowHandle,
        input: Value,
        options: RunOptions,
    ) -> Result<RunOutcome> {
        let run_id = options.run_id.unwrap_or_else(Uuid::new_v4);
        let _guard = self.acquire(run_id)?;
        let signals = self.signals(workflow, &options);

        let run = WorkflowRun::new(
            run_id,
            workflow.name(),
            workflow.version(),
            input.clone(),
            options.metadata.clone(),
        );
        if self.durable() {
            self.store.insert(&run).await?;
        }

        let ctx = ExecutionContext::new(run_id, workflow.name(), input)
            .with_metadata(options.metadata)
            .with_started_at(run.created_at);

        let span = tracing::info_span!(
            "workflow_run",
            run_id = %run_id,
            workflow = %workflow.name(),
            version = workflow.version()
        );
        Ok(self
            .drive(workflow, run, ctx, signals)
            .instrument(span)
            .await)
    }

    /// Continue a persisted, non-terminal run.
    ///
    /// Pending and running runs continue forward, skipping completed nodes
    /// and re-running the node that was in flight. Compensating runs
    /// continue the unwind. Like [`start`](Self::start), dropping the
    /// returned future cancels the run.
    pub async fn resume(self: &Arc<Self>, run_id: Uuid, mut options: RunOptions) -> Result<RunOutcome> {
        let _abandon = cancel_on_drop(&mut options);
        let executor = Arc::clone(self);
        detach(async move { executor.resume_run(run_id, options).await }).await
    }

    async fn resume_run(&self, run_id: Uuid, options: RunOptions) -> Result<RunOutcome> {
        let _guard = self.acquire(run_id)?;
        let run = self.load_incomplete(run_id).await?;
        let workflow = self.workflows.resolve(&run.workflow_name, run.version)?;
        let ctx = run.context()?;
        let signals = self.signals(&workflow, &options);

        let span = tracing::info_span!(
            "workflow_run",
            run_id = %run_id,
            workflow = %workflow.name(),
            version = workflow.version()
        );
        async {
            tracing::info!(status = %run.status, cursor = run.cursor, "Resuming workflow run");
            Ok::<_, FlowError>(self.drive(&workflow, run, ctx, signals).await)
        }
        .instrument(span)
        .await
    }

    /// Compensate a persisted, non-terminal run on operator request. The
    /// unwind completes even if the returned future is dropped.
    pub async fn rollback(self: &Arc<Self>, run_id: Uuid) -> Result<RunOutcome> {
        let executor = Arc::clone(self);
        detach(async move { executor.rollback_run(run_id).await }).await
    }

    async fn rollback_run(&self, run_id: Uuid) -> Result<RunOutcome> {
        let _guard = self.acquire(run_id)?;
        let mut run = self.load_incomplete(run_id).await?;
        let workflow = self.workflows.resolve(&run.workflow_name, run.version)?;
        let ctx = run.context()?;

        let span = tracing::info_span!(
            "workflow_run",
            run_id = %run_id,
            workflow = %workflow.name(),
            version = workflow.version()
        );
        async {
            if matches!(run.status, RunStatus::Pending | RunStatus::Running) {
                let node = next_node(&workflow, &run).unwrap_or_else(|| RESPONSE_NODE.to_string());
                tracing::info!(node = %node, "Rolling back workflow run");
                run.fail(StepFailure::new(
                    node,
                    StepError::cancelled("rolled back by operator"),
                ))?;
                self.checkpoint(&run).await;
            }
            Ok::<_, FlowError>(self.drive(&workflow, run, ctx, Signals::none()).await)
        }
        .instrument(span)
        .await
    }

    /// Apply the configured [`RecoveryPolicy`] to every non-terminal run in
    /// the store. Runs that fail to recover are logged and skipped.
    pub async fn recover_incomplete(self: &Arc<Self>) -> Result<Vec<RunOutcome>> {
        if !self.durable() {
            return Ok(Vec::new());
        }

        let policy = self.config.recovery;
        let runs = self.store.list(&RunFilter::incomplete()).await?;
        tracing::info!(count = runs.len(), policy = ?policy, "Recovering incomplete workflow runs");

        let mut outcomes = Vec::new();
        for run in runs {
            let attempt = match (policy, run.status) {
                (RecoveryPolicy::Manual, _) => {
                    tracing::info!(
                        run_id = %run.id,
                        workflow = %run.workflow_name,
                        status = %run.status,
                        "Leaving incomplete workflow run for manual recovery"
                    );
                    continue;
                }
                (_, RunStatus::Compensating) | (RecoveryPolicy::Resume, _) => {
                    self.resume(run.id, RunOptions::default()).await
                }
                (RecoveryPolicy::Compensate, _) => self.rollback(run.id).await,
            };
            match attempt {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(run_id = %run.id, error = %e, "Failed to recover workflow run");
                }
            }
        }
        Ok(outcomes)
    }

    /// Fetch a persisted run.
    pub async fn run_record(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        self.store.load(run_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        self.store.list(filter).await
    }

    async fn load_incomplete(&self, run_id: Uuid) -> Result<WorkflowRun> {
        if !self.durable() {
            return Err(FlowError::InvalidState(
                "run state is not persisted in ephemeral mode".into(),
            ));
        }
        let run = self
            .store
            .load(run_id)
            .await?
            .ok_or(FlowError::RunNotFound(run_id))?;
        if run.is_terminal() {
            return Err(FlowError::InvalidState(format!(
                "workflow run {} is already {}",
                run_id, run.status
            )));
        }
        Ok(run)
    }

    async fn drive(
        &self,
        workflow: &WorkflowHandle,
        mut run: WorkflowRun,
        mut ctx: ExecutionContext,
        signals: Signals,
    ) -> RunOutcome {
        if run.status == RunStatus::Pending {
            if let Err(e) = run.start() {
                return RunOutcome { run, result: Err(e) };
            }
            self.checkpoint(&run).await;
            tracing::debug!(nodes = workflow.graph().len(), "Workflow run started");
        }

        if run.status == RunStatus::Running {
            let failure = match self.forward(workflow, &mut run, &mut ctx, &signals).await {
                Ok(()) => match workflow.graph().output().resolve(&ctx) {
                    Ok(output) => {
                        if let Err(e) = run.succeed(output.clone()) {
                            return RunOutcome { run, result: Err(e) };
                        }
                        self.checkpoint(&run).await;
                        self.finalize(&run).await;
                        tracing::info!(nodes = run.completed.len(), "Workflow run succeeded");
                        return RunOutcome {
                            run,
                            result: Ok(output),
                        };
                    }
                    Err(error) => StepFailure::new(RESPONSE_NODE, error),
                },
                Err(failure) => failure,
            };

            tracing::warn!(
                node = %failure.node,
                error = %failure.error,
                completed = run.completed.len(),
                "Workflow run failed"
            );
            if let Err(e) = run.fail(failure) {
                return RunOutcome { run, result: Err(e) };
            }
            self.checkpoint(&run).await;
        }

        if run.status == RunStatus::Compensating {
            self.unwind(workflow, &mut run, &ctx).await;
        }

        let result = Err(run.error().unwrap_or_else(|| {
            FlowError::InvalidState(format!(
                "workflow run {} stopped in {} without an error",
                run.id, run.status
            ))
        }));
        RunOutcome { run, result }
    }

    async fn forward(
        &self,
        workflow: &WorkflowHandle,
        run: &mut WorkflowRun,
        ctx: &mut ExecutionContext,
        signals: &Signals,
    ) -> std::result::Result<(), StepFailure> {
        let graph = workflow.graph();
        let stages = graph.stages();

        while run.cursor < stages.len() {
            let nodes: Vec<&Node> = stages[run.cursor]
                .nodes()
                .iter()
                .filter_map(|&i| graph.node(i))
                .filter(|n| !run.is_completed(n.id()))
                .collect();

            if let Some(first) = nodes.first() {
                if let Some(error) = signals.interruption() {
                    return Err(StepFailure::new(first.id(), error));
                }
                for node in &nodes {
                    run.step_started(node.id());
                }
                self.checkpoint(run).await;
            }

            let mut in_flight: FuturesUnordered<_> = nodes
                .iter()
                .map(|node| self.execute_node(node, ctx.clone()))
                .collect();

            let mut failure: Option<StepFailure> = None;
            while let Some(done) = in_flight.next().await {
                match done.result {
                    Ok(output) => {
                        if let Err(e) = ctx.record(done.node.clone(), output.output.clone()) {
                            failure.get_or_insert(StepFailure::new(
                                done.node,
                                StepError::failed(e),
                            ));
                            continue;
                        }
                        tracing::debug!(node = %done.node, attempts = done.attempts, "Step completed");
                        run.step_completed(
                            &done.node,
                            done.input,
                            output,
                            done.compensable,
                            done.attempts,
                        );
                    }
                    Err(error) => {
                        tracing::warn!(
                            node = %done.node,
                            attempts = done.attempts,
                            error = %error,
                            "Step failed"
                        );
                        run.step_failed(&done.node, error.clone(), done.attempts);
                        failure.get_or_insert(StepFailure::new(done.node, error));
                    }
                }
                self.checkpoint(run).await;
            }

            if let Some(failure) = failure {
                return Err(failure);
            }
            run.cursor += 1;
            self.checkpoint(run).await;
        }

        // A caller that gave up never sees the response.
        if let Some(error) = signals.interruption() {
            return Err(StepFailure::new(RESPONSE_NODE, error));
        }
        Ok(())
    }

    async fn execute_node(&self, node: &Node, ctx: ExecutionContext) -> NodeRun {
        let id = node.id().to_string();
        let input = match node.input().resolve(&ctx) {
            Ok(input) => input,
            Err(error) => {
                return NodeRun {
                    node: id,
                    input: Value::Null,
                    result: Err(error),
                    attempts: 0,
                    compensable: false,
                }
            }
        };

        match node.kind() {
            NodeKind::Transform(transform) => {
                let result = (**transform)(input.clone()).map(|output| StepOutput {
                    output,
                    compensation_input: None,
                });
                NodeRun {
                    node: id,
                    input,
                    result,
                    attempts: 1,
                    compensable: false,
                }
            }
            NodeKind::Step(step) => {
                let (result, attempts) = self.invoke_step(&id, step, input.clone(), ctx).await;
                NodeRun {
                    node: id,
                    input,
                    result,
                    attempts,
                    compensable: step.is_compensable(),
                }
            }
        }
    }

    /// Invoke a forward function under its timeout and retry policy.
    async fn invoke_step(
        &self,
        node: &str,
        step: &StepHandle,
        input: Value,
        ctx: ExecutionContext,
    ) -> (std::result::Result<StepOutput, StepError>, u32) {
        let policy = step.retry_policy();
        let timeout = step.get_timeout().or(self.config.step_timeout());
        let mut attempt = 1;

        loop {
            tracing::debug!(node = %node, step = %step.name(), attempt, "Step started");
            let call = step.invoke(input.clone(), StepContext::new(ctx.clone(), node, attempt));
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::timeout(format!(
                        "step '{}' did not finish within {:?}",
                        step.name(),
                        limit
                    ))),
                },
                None => call.await,
            };

            match result {
                Ok(output) => return (Ok(output), attempt),
                Err(error) if policy.should_retry(attempt, &error) => {
                    let delay = policy.calculate_backoff(attempt);
                    tracing::warn!(
                        node = %node,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return (Err(error), attempt),
            }
        }
    }

    /// Compensate completed nodes newest first. Stops at the first failing
    /// compensation.
    ///
    /// Each compensation is marked before it is invoked. A marked node found
    /// on resume halts the unwind for an operator instead of running its
    /// compensation a second time.
    async fn unwind(&self, workflow: &WorkflowHandle, run: &mut WorkflowRun, ctx: &ExecutionContext) {
        let graph = workflow.graph();
        let pending = run.pending_compensations();
        tracing::info!(steps = pending.len(), "Compensating completed steps");

        for index in pending {
            let node = run.completed[index].node.clone();
            let payload = run.completed[index].compensation_payload();

            if run.completed[index].compensating {
                tracing::error!(node = %node, "Compensation outcome unknown, halting rollback");
                let error = StepError::failed(
                    "compensation was interrupted before its result was recorded; \
                     confirm its effect before rolling back further",
                );
                self.halt_unwind(run, CompensationError::new(node, error)).await;
                return;
            }

            let Some(step) = graph.node_by_id(&node).and_then(|n| n.step()) else {
                let error = StepError::failed("node is not part of the registered workflow");
                self.halt_unwind(run, CompensationError::new(node, error)).await;
                return;
            };

            tracing::info!(node = %node, step = %step.name(), "Compensating step");
            run.compensation_started(index);
            self.checkpoint(run).await;
            let result = match step.invoke_compensation(payload, StepContext::new(ctx.clone(), node.as_str(), 1)) {
                Some(call) => call.await,
                None => Ok(()),
            };

            match result {
                Ok(()) => {
                    run.compensated(index);
                    self.checkpoint(run).await;
                }
                Err(error) => {
                    tracing::error!(node = %node, error = %error, "Compensation failed, halting rollback");
                    self.halt_unwind(run, CompensationError::new(node, error)).await;
                    return;
                }
            }
        }

        if let Err(e) = run.compensation_finished() {
            tracing::error!(error = %e, "Failed to finish rollback");
        }
        self.checkpoint(run).await;
        tracing::info!("Workflow run rolled back");
    }

    async fn halt_unwind(&self, run: &mut WorkflowRun, error: CompensationError) {
        if let Err(e) = run.compensation_failed(error) {
            tracing::error!(error = %e, "Failed to record compensation failure");
        }
        self.checkpoint(run).await;
    }

    /// Persist the run. Failures are logged and the run continues.
    async fn checkpoint(&self, run: &WorkflowRun) {
        if !self.durable() {
            return;
        }
        if let Err(e) = self.store.save(run).await {
            tracing::error!(
                run_id = %run.id,
                status = %run.status,
                error = %e,
                "Failed to checkpoint workflow run"
            );
        }
    }

    async fn finalize(&self, run: &WorkflowRun) {
        if !self.durable() || self.config.retain_completed_runs || run.status != RunStatus::Succeeded {
            return;
        }
        if let Err(e) = self.store.delete(run.id).await {
            tracing::error!(run_id = %run.id, error = %e, "Failed to delete completed workflow run");
        }
    }
}

/// Chain the run's cancellation to the caller: the returned guard cancels
/// it when dropped.
fn cancel_on_drop(options: &mut RunOptions) -> DropGuard {
    let token = options
        .cancellation
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_default();
    options.cancellation = Some(token.clone());
    token.drop_guard()
}

/// Drive a run on its own task so it reaches a terminal state even when
/// the caller stops waiting.
async fn detach<F>(run: F) -> Result<RunOutcome>
where
    F: Future<Output = Result<RunOutcome>> + Send + 'static,
{
    match tokio::spawn(run.in_current_span()).await {
        Ok(outcome) => outcome,
        Err(e) => Err(FlowError::InvalidState(format!(
            "workflow run task ended abnormally: {}",
            e
        ))),
    }
}

/// First node of the cursor stage that has not completed.
fn next_node(workflow: &WorkflowHandle, run: &WorkflowRun) -> Option<String> {
    let graph = workflow.graph();
    let stage = graph.stages().get(run.cursor)?;
    stage
        .nodes()
        .iter()
        .filter_map(|&i| graph.node(i))
        .find(|n| !run.is_completed(n.id()))
        .map(|n| n.id().to_string())
}
