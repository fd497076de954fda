use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use sagaflow_core::workflow::{StepDefinition, StepHandle, WorkflowDefinition, WorkflowHandle};
use sagaflow_core::{FlowError, Result};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Registry of all steps, keyed by unique name.
#[derive(Default)]
pub struct StepRegistry {
    steps: RwLock<HashMap<String, StepHandle>>,
}

impl StepRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Fails if the name is taken.
    pub fn register(&self, definition: StepDefinition) -> Result<StepHandle> {
        self.register_handle(StepHandle::new(definition))
    }

    /// Register an already shared step.
    pub fn register_handle(&self, handle: StepHandle) -> Result<StepHandle> {
        let mut steps = write(&self.steps);
        if steps.contains_key(handle.name()) {
            return Err(FlowError::DuplicateStep(handle.name().to_string()));
        }
        steps.insert(handle.name().to_string(), handle.clone());
        tracing::debug!(
            step = %handle.name(),
            compensable = handle.is_compensable(),
            "Step registered"
        );
        Ok(handle)
    }

    /// Get a step by name.
    pub fn get(&self, name: &str) -> Option<StepHandle> {
        read(&self.steps).get(name).cloned()
    }

    /// Get all step names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.steps).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        read(&self.steps).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.steps).is_empty()
    }
}

/// Registry of all workflows, keyed by unique name.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, WorkflowHandle>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow. Fails if the name is taken.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<WorkflowHandle> {
        let mut workflows = write(&self.workflows);
        if workflows.contains_key(definition.name()) {
            return Err(FlowError::DuplicateWorkflow(definition.name().to_string()));
        }
        let handle = definition.into_handle();
        workflows.insert(handle.name().to_string(), handle.clone());
        tracing::debug!(
            workflow = %handle.name(),
            version = handle.version(),
            nodes = handle.graph().len(),
            "Workflow registered"
        );
        Ok(handle)
    }

    /// Get a workflow by name.
    pub fn get(&self, name: &str) -> Option<WorkflowHandle> {
        read(&self.workflows).get(name).cloned()
    }

    /// Get a workflow by name and version.
    pub fn get_version(&self, name: &str, version: u32) -> Option<WorkflowHandle> {
        self.get(name).filter(|w| w.version() == version)
    }

    /// Look up the definition a persisted run was started with.
    pub fn resolve(&self, name: &str, version: u32) -> Result<WorkflowHandle> {
        let workflow = self
            .get(name)
            .ok_or_else(|| FlowError::UnknownWorkflow(name.to_string()))?;
        if workflow.version() != version {
            return Err(FlowError::InvalidState(format!(
                "run was started with version {} of '{}' but version {} is registered",
                version,
                name,
                workflow.version()
            )));
        }
        Ok(workflow)
    }

    /// List all registered workflows, sorted by name.
    pub fn list(&self) -> Vec<WorkflowHandle> {
        let mut workflows: Vec<WorkflowHandle> = read(&self.workflows).values().cloned().collect();
        workflows.sort_by(|a, b| a.name().cmp(b.name()));
        workflows
    }

    pub fn names(&self) -> Vec<String> {
        self.list().iter().map(|w| w.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        read(&self.workflows).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.workflows).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::workflow::{WorkflowInfo, WorkflowResponse};
    use serde_json::Value;

    fn echo(name: &str) -> StepDefinition {
        StepDefinition::new(name, |v: Value, _ctx| async move { Ok(v) })
    }

    fn workflow(name: &str, version: u32) -> WorkflowDefinition {
        WorkflowDefinition::build(WorkflowInfo::new(name).version(version), None, |_, input| {
            Ok(WorkflowResponse::new(input))
        })
        .unwrap()
    }

    #[test]
    fn test_empty_registry() {
        let registry = WorkflowRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(StepRegistry::new().is_empty());
    }

    #[test]
    fn test_duplicate_step_fails_fast() {
        let registry = StepRegistry::new();
        registry.register(echo("update-address")).unwrap();

        let err = registry.register(echo("update-address")).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateStep(name) if name == "update-address"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["update-address"]);
    }

    #[test]
    fn test_registered_handle_is_shared() {
        let registry = StepRegistry::new();
        let handle = registry.register(echo("a")).unwrap();
        assert!(registry.get("a").unwrap().same_as(&handle));
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn test_duplicate_workflow_fails_fast() {
        let registry = WorkflowRegistry::new();
        registry.register(workflow("flow", 1)).unwrap();
        let err = registry.register(workflow("flow", 2)).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateWorkflow(_)));
    }

    #[test]
    fn test_resolve_checks_version() {
        let registry = WorkflowRegistry::new();
        registry.register(workflow("flow", 2)).unwrap();

        assert!(registry.resolve("flow", 2).is_ok());
        assert!(registry.get_version("flow", 1).is_none());
        assert!(matches!(
            registry.resolve("flow", 1),
            Err(FlowError::InvalidState(_))
        ));
        assert!(matches!(
            registry.resolve("other", 1),
            Err(FlowError::UnknownWorkflow(_))
        ));
    }
}
