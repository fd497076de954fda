use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::binding::Data;
use super::builder::{WorkflowBuilder, WorkflowResponse};
use super::graph::{GraphDescription, WorkflowGraph};
use super::read::EntityReader;
use crate::error::{FlowError, Result};

/// Identity and limits of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    /// Bumped whenever the graph changes shape; persisted runs record it.
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl WorkflowInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            description: None,
            timeout: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Deadline for a whole run, checked between stages.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for WorkflowInfo {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for WorkflowInfo {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// A workflow planned once into an immutable graph.
#[derive(Debug)]
pub struct WorkflowDefinition {
    info: WorkflowInfo,
    graph: WorkflowGraph,
}

impl WorkflowDefinition {
    /// Run the definition function once in planning mode and validate the
    /// resulting graph.
    pub fn build<F>(info: WorkflowInfo, reader: Option<Arc<dyn EntityReader>>, f: F) -> Result<Self>
    where
        F: FnOnce(&mut WorkflowBuilder, Data) -> Result<WorkflowResponse>,
    {
        if info.name.trim().is_empty() {
            return Err(FlowError::Definition("workflow name cannot be empty".into()));
        }

        let mut builder = WorkflowBuilder::new(info.name.clone(), reader);
        let response = f(&mut builder, Data::input())?;
        let graph = builder.finish(response)?;

        tracing::debug!(
            workflow = %info.name,
            version = info.version,
            nodes = graph.len(),
            stages = graph.stages().len(),
            "Workflow graph built"
        );

        Ok(Self { info, graph })
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn version(&self) -> u32 {
        self.info.version
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn describe(&self) -> GraphDescription {
        self.graph.describe()
    }

    pub fn into_handle(self) -> WorkflowHandle {
        WorkflowHandle(Arc::new(self))
    }
}

/// Shared, immutable reference to a registered workflow.
#[derive(Debug, Clone)]
pub struct WorkflowHandle(Arc<WorkflowDefinition>);

impl WorkflowHandle {
    pub fn same_as(&self, other: &WorkflowHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for WorkflowHandle {
    type Target = WorkflowDefinition;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::{StepDefinition, StepHandle};
    use serde_json::Value;

    #[test]
    fn test_build_runs_definition_once() {
        let step = StepHandle::new(StepDefinition::new("echo", |v: Value, _ctx| async move {
            Ok(v)
        }));
        let mut calls = 0;
        let definition = WorkflowDefinition::build(
            WorkflowInfo::new("echo-flow").version(3).describe("echoes"),
            None,
            |b, input| {
                calls += 1;
                Ok(WorkflowResponse::new(b.step(&step, input)?))
            },
        )
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(definition.name(), "echo-flow");
        assert_eq!(definition.version(), 3);
        assert_eq!(definition.graph().len(), 1);
        assert_eq!(definition.describe().stages, vec![vec!["echo"]]);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let err = WorkflowDefinition::build(WorkflowInfo::new(" "), None, |_, _| {
            Ok(WorkflowResponse::empty())
        })
        .unwrap_err();
        assert!(matches!(err, FlowError::Definition(_)));
    }

    #[test]
    fn test_definition_errors_propagate() {
        let err = WorkflowDefinition::build("bad".into(), None, |_, _| {
            Err(FlowError::Definition("boom".into()))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid workflow definition: boom");
    }
}
