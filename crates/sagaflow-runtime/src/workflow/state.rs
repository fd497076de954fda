use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use sagaflow_core::workflow::{ExecutionContext, RunStatus, StepOutput, StepStatus};
use sagaflow_core::{CompensationError, FlowError, Result, StepError, StepFailure};

/// Attempt history of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Node identity.
    pub node: String,
    /// Current status.
    pub status: StepStatus,
    /// Forward attempts made so far.
    pub attempts: u32,
    /// Last error, forward or compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A node whose forward function completed in this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedNode {
    pub node: String,
    /// Resolved input the node ran with.
    pub input: Value,
    pub output: Value,
    /// Explicit payload for the compensation, if the step returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_input: Option<Value>,
    /// Whether rollback invokes a compensation for this node.
    pub compensable: bool,
    #[serde(default)]
    pub compensated: bool,
    /// Set while the compensation is being invoked. Still set on load
    /// means the compensation may have run without its result being saved.
    #[serde(default)]
    pub compensating: bool,
    pub completed_at: DateTime<Utc>,
}

impl CompletedNode {
    /// What the compensation receives: the explicit payload, else the
    /// output, else the input when the output is `null`.
    pub fn compensation_payload(&self) -> Value {
        if let Some(payload) = &self.compensation_input {
            return payload.clone();
        }
        if !self.output.is_null() {
            return self.output.clone();
        }
        self.input.clone()
    }
}

/// Persisted state of a workflow run.
///
/// Everything needed to resume forward progress or continue a rollback
/// after a restart: the input, the completed-node list with captured
/// outputs, and the stage cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique workflow run ID.
    pub id: Uuid,
    pub workflow_name: String,
    pub version: u32,
    pub input: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub status: RunStatus,
    /// Index of the next stage to run.
    pub cursor: usize,
    /// Per-node attempt history, in first-start order.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Completed nodes, in completion order.
    #[serde(default)]
    pub completed: Vec<CompletedNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// The step failure that aborted forward progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// The compensation failure that halted rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_failure: Option<CompensationError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Create a pending run.
    pub fn new(
        id: Uuid,
        workflow_name: impl Into<String>,
        version: u32,
        input: Value,
        metadata: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_name: workflow_name.into(),
            version,
            input,
            metadata,
            status: RunStatus::Pending,
            cursor: 0,
            steps: Vec::new(),
            completed: Vec::new(),
            output: None,
            failure: None,
            compensation_failure: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidState(format!(
                "run {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.touch();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Mark as running.
    pub fn start(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn step_record(&mut self, node: &str) -> &mut StepRecord {
        let position = match self.steps.iter().position(|s| s.node == node) {
            Some(position) => position,
            None => {
                self.steps.push(StepRecord::new(node));
                self.steps.len() - 1
            }
        };
        &mut self.steps[position]
    }

    /// Find a node's attempt history.
    pub fn step(&self, node: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.node == node)
    }

    /// Record that a node is about to run.
    pub fn step_started(&mut self, node: &str) {
        let now = Utc::now();
        let record = self.step_record(node);
        record.status = StepStatus::Running;
        record.error = None;
        record.started_at.get_or_insert(now);
        self.touch();
    }

    /// Record a completed forward call and append it to the completed list.
    pub fn step_completed(
        &mut self,
        node: &str,
        input: Value,
        output: StepOutput,
        compensable: bool,
        attempts: u32,
    ) {
        let now = Utc::now();
        let record = self.step_record(node);
        record.status = StepStatus::Completed;
        record.attempts += attempts;
        record.completed_at = Some(now);
        self.completed.push(CompletedNode {
            node: node.to_string(),
            input,
            output: output.output,
            compensation_input: output.compensation_input,
            compensable,
            compensated: false,
            compensating: false,
            completed_at: now,
        });
        self.touch();
    }

    pub fn step_failed(&mut self, node: &str, error: StepError, attempts: u32) {
        let record = self.step_record(node);
        record.status = StepStatus::Failed;
        record.attempts += attempts;
        record.error = Some(error);
        self.touch();
    }

    pub fn is_completed(&self, node: &str) -> bool {
        self.completed.iter().any(|c| c.node == node)
    }

    /// Succeed with the computed response.
    pub fn succeed(&mut self, output: Value) -> Result<()> {
        self.transition(RunStatus::Succeeded)?;
        self.output = Some(output);
        Ok(())
    }

    /// Stop forward progress because of `failure`.
    ///
    /// Goes straight to `failed` when nothing completed; otherwise the run
    /// starts compensating.
    pub fn fail(&mut self, failure: StepFailure) -> Result<()> {
        let next = if self.completed.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Compensating
        };
        if self.status == RunStatus::Pending && next == RunStatus::Compensating {
            return Err(FlowError::InvalidState(format!(
                "run {} has completed nodes but never started",
                self.id
            )));
        }
        self.transition(next)?;
        self.failure = Some(failure);
        Ok(())
    }

    /// Completed list positions still awaiting compensation, newest first.
    pub fn pending_compensations(&self) -> Vec<usize> {
        (0..self.completed.len())
            .rev()
            .filter(|&i| self.completed[i].compensable && !self.completed[i].compensated)
            .collect()
    }

    /// Mark a compensation as invoked but not yet acknowledged.
    pub fn compensation_started(&mut self, index: usize) {
        if let Some(entry) = self.completed.get_mut(index) {
            entry.compensating = true;
            self.touch();
        }
    }

    pub fn compensated(&mut self, index: usize) {
        let Some(entry) = self.completed.get_mut(index) else {
            return;
        };
        entry.compensated = true;
        entry.compensating = false;
        let node = entry.node.clone();
        let record = self.step_record(&node);
        record.status = StepStatus::Compensated;
        self.touch();
    }

    /// Halt the unwind.
    pub fn compensation_failed(&mut self, error: CompensationError) -> Result<()> {
        let record = self.step_record(&error.node);
        record.status = StepStatus::CompensationFailed;
        record.error = Some(error.error.clone());
        self.transition(RunStatus::CompensationFailed)?;
        self.compensation_failure = Some(error);
        Ok(())
    }

    /// Finish an unwind in which every compensation succeeded.
    pub fn compensation_finished(&mut self) -> Result<()> {
        self.transition(RunStatus::Failed)
    }

    /// The error a terminal failed run surfaces to its caller.
    pub fn error(&self) -> Option<FlowError> {
        match (&self.failure, &self.compensation_failure) {
            (Some(trigger), Some(compensation)) => Some(FlowError::CompositeFailure {
                trigger: trigger.clone(),
                compensation: compensation.clone(),
            }),
            (Some(trigger), None) => Some(FlowError::Step(trigger.clone())),
            (None, Some(compensation)) => Some(FlowError::CompositeFailure {
                trigger: StepFailure::new(
                    compensation.node.clone(),
                    StepError::failed("run aborted without a recorded trigger"),
                ),
                compensation: compensation.clone(),
            }),
            (None, None) => None,
        }
    }

    /// Rebuild the execution context from the completed list.
    pub fn context(&self) -> Result<ExecutionContext> {
        let mut ctx = ExecutionContext::new(self.id, self.workflow_name.as_str(), self.input.clone())
            .with_metadata(self.metadata.clone())
            .with_started_at(self.created_at);
        for entry in &self.completed {
            ctx.record(entry.node.clone(), entry.output.clone())?;
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run() -> WorkflowRun {
        WorkflowRun::new(Uuid::new_v4(), "flow", 1, json!({"id": 1}), Map::new())
    }

    fn output(value: Value) -> StepOutput {
        StepOutput {
            output: value,
            compensation_input: None,
        }
    }

    #[test]
    fn test_run_lifecycle_success() {
        let mut run = run();
        assert_eq!(run.status, RunStatus::Pending);
        run.start().unwrap();
        run.step_started("a");
        run.step_completed("a", json!(1), output(json!({"v": 1})), true, 1);
        run.succeed(json!({"v": 1})).unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.completed_at.is_some());
        assert_eq!(run.step("a").unwrap().status, StepStatus::Completed);
        assert!(run.error().is_none());
    }

    #[test]
    fn test_failure_without_completed_nodes_skips_compensating() {
        let mut run = run();
        run.start().unwrap();
        run.step_started("a");
        run.step_failed("a", StepError::failed("boom"), 1);
        run.fail(StepFailure::new("a", StepError::failed("boom")))
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(matches!(run.error(), Some(FlowError::Step(_))));
    }

    #[test]
    fn test_failure_after_completion_compensates() {
        let mut run = run();
        run.start().unwrap();
        run.step_completed("a", json!(1), output(json!(1)), true, 1);
        run.step_completed("r", json!(1), output(json!(1)), false, 1);
        run.step_completed("b", json!(2), output(json!(2)), true, 1);
        run.fail(StepFailure::new("c", StepError::failed("boom")))
            .unwrap();

        assert_eq!(run.status, RunStatus::Compensating);
        assert_eq!(run.pending_compensations(), vec![2, 0]);

        run.compensation_started(2);
        assert!(run.completed[2].compensating);
        assert_eq!(run.pending_compensations(), vec![2, 0]);

        run.compensated(2);
        assert!(!run.completed[2].compensating);
        assert_eq!(run.pending_compensations(), vec![0]);
        assert_eq!(run.step("b").unwrap().status, StepStatus::Compensated);

        run.compensation_failed(CompensationError::new("a", StepError::failed("stuck")))
            .unwrap();
        assert_eq!(run.status, RunStatus::CompensationFailed);
        match run.error() {
            Some(FlowError::CompositeFailure {
                trigger,
                compensation,
            }) => {
                assert_eq!(trigger.node, "c");
                assert_eq!(compensation.node, "a");
            }
            other => panic!("expected composite failure, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut run = run();
        assert!(run.succeed(json!(null)).is_err());
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.output.is_none());
    }

    #[test]
    fn test_compensation_payload_resolution() {
        let mut entry = CompletedNode {
            node: "a".into(),
            input: json!({"id": "in"}),
            output: json!({"id": "out"}),
            compensation_input: Some(json!({"id": "explicit"})),
            compensable: true,
            compensated: false,
            compensating: false,
            completed_at: Utc::now(),
        };
        assert_eq!(entry.compensation_payload(), json!({"id": "explicit"}));

        entry.compensation_input = None;
        assert_eq!(entry.compensation_payload(), json!({"id": "out"}));

        entry.output = Value::Null;
        assert_eq!(entry.compensation_payload(), json!({"id": "in"}));
    }

    #[test]
    fn test_context_rebuilt_from_completed_nodes() {
        let mut run = run();
        run.start().unwrap();
        run.step_completed("a", json!(1), output(json!("A")), false, 1);
        run.step_completed("b", json!(1), output(json!("B")), false, 1);

        let ctx = run.context().unwrap();
        assert_eq!(ctx.completed_nodes(), vec!["a", "b"]);
        assert_eq!(ctx.input(), &json!({"id": 1}));
        assert_eq!(ctx.run_id(), run.id);
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let mut run = run();
        run.start().unwrap();
        run.step_completed("a", json!(1), output(json!("A")), true, 2);

        let json = serde_json::to_string(&run).unwrap();
        let back: WorkflowRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
