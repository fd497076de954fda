use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{FlowError, Result, StepError};

/// Run-scoped store of the original input and every node output.
///
/// Outputs are kept in execution order and are append-only: recording a
/// node twice is an error. Clones are cheap snapshots; the orchestrator
/// owns the only mutable copy for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: Uuid,
    workflow_name: Arc<str>,
    started_at: DateTime<Utc>,
    input: Arc<Value>,
    metadata: Arc<Map<String, Value>>,
    outputs: Arc<IndexMap<String, Value>>,
}

impl ExecutionContext {
    /// Create a context for a fresh run.
    pub fn new(run_id: Uuid, workflow_name: impl Into<Arc<str>>, input: Value) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            started_at: Utc::now(),
            input: Arc::new(input),
            metadata: Arc::new(Map::new()),
            outputs: Arc::new(IndexMap::new()),
        }
    }

    /// Attach caller-supplied run metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    /// Keep the original start time when rebuilding a persisted run.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The original workflow input.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Deserialize the original workflow input.
    pub fn input_as<T: DeserializeOwned>(&self) -> std::result::Result<T, StepError> {
        serde_json::from_value(self.input.as_ref().clone()).map_err(StepError::from)
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Raw output of a completed node.
    pub fn output(&self, node: &str) -> Option<&Value> {
        self.outputs.get(node)
    }

    /// Deserialize the output of a completed node.
    pub fn get<T: DeserializeOwned>(&self, node: &str) -> std::result::Result<Option<T>, StepError> {
        self.outputs
            .get(node)
            .map(|v| serde_json::from_value(v.clone()).map_err(StepError::from))
            .transpose()
    }

    /// Check if a node has recorded an output.
    pub fn contains(&self, node: &str) -> bool {
        self.outputs.contains_key(node)
    }

    /// Node outputs in execution order.
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.outputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Node identities in execution order.
    pub fn completed_nodes(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Append a node output.
    ///
    /// Fails if the node already recorded an output; earlier outputs are
    /// never overwritten.
    pub fn record(&mut self, node: impl Into<String>, output: Value) -> Result<()> {
        let node = node.into();
        if self.outputs.contains_key(&node) {
            return Err(FlowError::InvalidState(format!(
                "output of node '{}' is already recorded",
                node
            )));
        }
        Arc::make_mut(&mut self.outputs).insert(node, output);
        Ok(())
    }
}

/// What a step function sees of its run.
///
/// A read-only snapshot of the execution context taken when the step was
/// invoked, plus the node identity and attempt number.
#[derive(Debug, Clone)]
pub struct StepContext {
    run: ExecutionContext,
    node: Arc<str>,
    attempt: u32,
}

impl StepContext {
    pub fn new(run: ExecutionContext, node: impl Into<Arc<str>>, attempt: u32) -> Self {
        Self {
            run,
            node: node.into(),
            attempt,
        }
    }

    /// Node identity of the invocation.
    pub fn node_id(&self) -> &str {
        &self.node
    }

    /// 1-based attempt number; greater than one only under a retry policy.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn run(&self) -> &ExecutionContext {
        &self.run
    }

    pub fn run_id(&self) -> Uuid {
        self.run.run_id()
    }

    pub fn workflow_name(&self) -> &str {
        self.run.workflow_name()
    }

    pub fn workflow_input(&self) -> &Value {
        self.run.input()
    }

    pub fn output(&self, node: &str) -> Option<&Value> {
        self.run.output(node)
    }

    pub fn get<T: DeserializeOwned>(&self, node: &str) -> std::result::Result<Option<T>, StepError> {
        self.run.get(node)
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.run.metadata().get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), "test", json!({"id": "addr_1"}))
    }

    #[test]
    fn test_outputs_keep_execution_order() {
        let mut ctx = context();
        ctx.record("second", json!(2)).unwrap();
        ctx.record("first", json!(1)).unwrap();

        let order: Vec<&str> = ctx.outputs().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["second", "first"]);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_record_is_append_only() {
        let mut ctx = context();
        ctx.record("step", json!({"v": 1})).unwrap();

        let err = ctx.record("step", json!({"v": 2})).unwrap_err();
        assert!(matches!(err, FlowError::InvalidState(_)));
        assert_eq!(ctx.output("step"), Some(&json!({"v": 1})));
    }

    #[test]
    fn test_snapshot_does_not_see_later_outputs() {
        let mut ctx = context();
        ctx.record("a", json!("a")).unwrap();
        let snapshot = ctx.clone();
        ctx.record("b", json!("b")).unwrap();

        assert!(snapshot.contains("a"));
        assert!(!snapshot.contains("b"));
        assert!(ctx.contains("b"));
    }

    #[test]
    fn test_typed_access() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Input {
            id: String,
        }

        let mut ctx = context();
        ctx.record("count", json!(3)).unwrap();

        let input: Input = ctx.input_as().unwrap();
        assert_eq!(input.id, "addr_1");
        assert_eq!(ctx.get::<u32>("count").unwrap(), Some(3));
        assert_eq!(ctx.get::<u32>("missing").unwrap(), None);
        assert!(ctx.get::<String>("count").is_err());
    }

    #[test]
    fn test_step_context_delegates() {
        let mut ctx = context();
        ctx.record("read", json!({"id": "x"})).unwrap();
        let mut metadata = Map::new();
        metadata.insert("actor".into(), json!("admin"));
        let ctx = ctx.with_metadata(metadata);

        let step_ctx = StepContext::new(ctx.clone(), "update", 2);
        assert_eq!(step_ctx.node_id(), "update");
        assert_eq!(step_ctx.attempt(), 2);
        assert_eq!(step_ctx.run_id(), ctx.run_id());
        assert_eq!(step_ctx.output("read"), Some(&json!({"id": "x"})));
        assert_eq!(step_ctx.metadata("actor"), Some(&json!("admin")));
        assert_eq!(step_ctx.workflow_input(), &json!({"id": "addr_1"}));
    }
}
