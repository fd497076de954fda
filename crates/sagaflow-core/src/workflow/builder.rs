use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::binding::Data;
use super::definition::WorkflowHandle;
use super::graph::{Node, NodeKind, TransformFn, WorkflowGraph};
use super::read::{EntityReader, ReadStep};
use super::step::StepHandle;
use crate::error::{FlowError, Result, StepError};

/// Separator between a composed workflow's node id and its inner node ids.
pub const NODE_PATH_SEPARATOR: char = ':';

/// Final output of a workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowResponse {
    output: Data,
}

impl WorkflowResponse {
    pub fn new(output: impl Into<Data>) -> Self {
        Self {
            output: output.into(),
        }
    }

    /// A workflow that responds with `null`.
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    pub fn output(&self) -> &Data {
        &self.output
    }
}

/// Records the graph of a workflow while its definition function runs.
///
/// Every call appends a node and hands back a [`Data`] placeholder for its
/// output. Nothing executes here.
pub struct WorkflowBuilder {
    workflow: String,
    reader: Option<Arc<dyn EntityReader>>,
    nodes: Vec<Node>,
    ids: HashSet<String>,
    groups: HashMap<String, Option<usize>>,
    group: Option<usize>,
    next_group: usize,
}

impl WorkflowBuilder {
    pub(crate) fn new(workflow: impl Into<String>, reader: Option<Arc<dyn EntityReader>>) -> Self {
        Self {
            workflow: workflow.into(),
            reader,
            nodes: Vec::new(),
            ids: HashSet::new(),
            groups: HashMap::new(),
            group: None,
            next_group: 0,
        }
    }

    /// Name of the workflow being defined.
    pub fn workflow_name(&self) -> &str {
        &self.workflow
    }

    /// Use a step under its own name.
    ///
    /// Fails if the step is already used in this workflow; later uses need
    /// [`step_as`](Self::step_as).
    pub fn step(&mut self, step: &StepHandle, input: impl Into<Data>) -> Result<Data> {
        let id = step.name().to_string();
        if self.ids.contains(&id) {
            return Err(FlowError::Definition(format!(
                "step '{}' is used more than once in workflow '{}'; repeated uses need an explicit node id",
                id, self.workflow
            )));
        }
        self.push(id, NodeKind::Step(step.clone()), input.into())
    }

    /// Use a step under an explicit node id.
    pub fn step_as(
        &mut self,
        id: impl Into<String>,
        step: &StepHandle,
        input: impl Into<Data>,
    ) -> Result<Data> {
        let id = explicit_id(id.into())?;
        self.push(id, NodeKind::Step(step.clone()), input.into())
    }

    /// Add a read through the workflow's entity reader. `filters` is the
    /// node input.
    pub fn read(&mut self, read: ReadStep, filters: impl Into<Data>) -> Result<Data> {
        let id = read.name();
        if self.ids.contains(&id) {
            return Err(FlowError::Definition(format!(
                "read step '{}' is used more than once in workflow '{}'; repeated uses need an explicit node id",
                id, self.workflow
            )));
        }
        let step = self.read_step(read)?;
        self.push(id, NodeKind::Step(step), filters.into())
    }

    pub fn read_as(
        &mut self,
        id: impl Into<String>,
        read: ReadStep,
        filters: impl Into<Data>,
    ) -> Result<Data> {
        let id = explicit_id(id.into())?;
        let step = self.read_step(read)?;
        self.push(id, NodeKind::Step(step), filters.into())
    }

    fn read_step(&self, read: ReadStep) -> Result<StepHandle> {
        let reader = self.reader.clone().ok_or_else(|| {
            FlowError::Definition(format!(
                "workflow '{}' reads '{}' but no entity reader is configured",
                self.workflow,
                read.entry_point()
            ))
        })?;
        Ok(read.into_step(reader))
    }

    /// Add a pure, synchronous transformation of `input`.
    pub fn transform<I, O, F>(
        &mut self,
        id: impl Into<String>,
        input: impl Into<Data>,
        f: F,
    ) -> Result<Data>
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        let id = explicit_id(id.into())?;
        let node = id.clone();
        let transform: TransformFn = Arc::new(move |value: Value| {
            let typed: I = serde_json::from_value(value).map_err(|e| {
                StepError::serialization(format!("invalid input for transform '{}': {}", node, e))
            })?;
            serde_json::to_value(f(typed)).map_err(StepError::from)
        });
        self.push(id, NodeKind::Transform(transform), input.into())
    }

    /// Compose another workflow under its own name.
    pub fn workflow(&mut self, child: &WorkflowHandle, input: impl Into<Data>) -> Result<Data> {
        let id = child.name().to_string();
        if self.ids.contains(&id) {
            return Err(FlowError::Definition(format!(
                "workflow '{}' is composed more than once in '{}'; repeated uses need an explicit node id",
                id, self.workflow
            )));
        }
        self.inline(id, child, input.into())
    }

    pub fn workflow_as(
        &mut self,
        id: impl Into<String>,
        child: &WorkflowHandle,
        input: impl Into<Data>,
    ) -> Result<Data> {
        let id = explicit_id(id.into())?;
        self.inline(id, child, input.into())
    }

    /// Declare nodes that run concurrently.
    ///
    /// Nodes inside the group may read outputs of earlier nodes but not of
    /// each other. Groups cannot be nested and cannot compose workflows.
    pub fn parallel<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WorkflowBuilder) -> Result<T>,
    {
        if self.group.is_some() {
            return Err(FlowError::Definition(format!(
                "parallel groups cannot be nested (workflow '{}')",
                self.workflow
            )));
        }
        self.group = Some(self.allocate_group());
        let result = f(self);
        self.group = None;
        result
    }

    fn allocate_group(&mut self) -> usize {
        let group = self.next_group;
        self.next_group += 1;
        group
    }

    fn reserve(&mut self, id: &str) -> Result<()> {
        if !self.ids.insert(id.to_string()) {
            return Err(FlowError::Definition(format!(
                "node id '{}' is used more than once in workflow '{}'",
                id, self.workflow
            )));
        }
        Ok(())
    }

    fn check_inputs(&self, id: &str, input: &Data) -> Result<()> {
        for dependency in input.binding().dependencies() {
            let Some(group) = self.groups.get(&dependency) else {
                return Err(FlowError::Definition(format!(
                    "node '{}' in workflow '{}' reads '{}', which is not part of this workflow",
                    id, self.workflow, dependency
                )));
            };
            if self.group.is_some() && *group == self.group {
                return Err(FlowError::Definition(format!(
                    "node '{}' reads '{}' from its own parallel group",
                    id, dependency
                )));
            }
        }
        Ok(())
    }

    fn push(&mut self, id: String, kind: NodeKind, input: Data) -> Result<Data> {
        self.check_inputs(&id, &input)?;
        self.reserve(&id)?;
        self.groups.insert(id.clone(), self.group);
        self.nodes
            .push(Node::new(id.clone(), kind, input.into_binding(), self.group));
        Ok(Data::output(id))
    }

    fn inline(&mut self, id: String, child: &WorkflowHandle, input: Data) -> Result<Data> {
        if self.group.is_some() {
            return Err(FlowError::Definition(format!(
                "workflow '{}' cannot be composed inside a parallel group",
                child.name()
            )));
        }
        self.check_inputs(&id, &input)?;
        self.reserve(&id)?;

        let prefix = |node: &str| format!("{}{}{}", id, NODE_PATH_SEPARATOR, node);
        let input = input.into_binding();
        let mut remapped: HashMap<usize, usize> = HashMap::new();

        for node in child.graph().nodes() {
            let group = match node.group() {
                Some(inner) => Some(match remapped.get(&inner) {
                    Some(&outer) => outer,
                    None => {
                        let outer = self.allocate_group();
                        remapped.insert(inner, outer);
                        outer
                    }
                }),
                None => None,
            };
            let node_id = prefix(node.id());
            self.reserve(&node_id)?;
            self.groups.insert(node_id.clone(), group);
            let binding = node.input().rebase(&input, &prefix);
            self.nodes.push(node.rebase(node_id, binding, group));
        }

        Ok(Data::new(child.graph().output().rebase(&input, &prefix)))
    }

    pub(crate) fn finish(self, response: WorkflowResponse) -> Result<WorkflowGraph> {
        WorkflowGraph::new(self.nodes, response.output.into_binding())
    }
}

fn explicit_id(id: String) -> Result<String> {
    if id.is_empty() {
        return Err(FlowError::Definition("node id cannot be empty".into()));
    }
    if id.contains(NODE_PATH_SEPARATOR) {
        return Err(FlowError::Definition(format!(
            "node id '{}' cannot contain '{}'",
            id, NODE_PATH_SEPARATOR
        )));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::binding::Binding;
    use crate::workflow::definition::{WorkflowDefinition, WorkflowInfo};
    use crate::workflow::graph::Stage;
    use crate::workflow::read::ReadRequest;
    use crate::workflow::step::StepDefinition;
    use async_trait::async_trait;
    use serde_json::json;

    fn step(name: &str) -> StepHandle {
        StepHandle::new(StepDefinition::new(name, |v: Value, _ctx| async move { Ok(v) }))
    }

    struct NullReader;

    #[async_trait]
    impl EntityReader for NullReader {
        async fn read(&self, _request: ReadRequest) -> std::result::Result<Value, StepError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_first_use_takes_step_name() {
        let update = step("update-address");
        let mut b = WorkflowBuilder::new("wf", None);
        let out = b.step(&update, Data::input()).unwrap();
        assert_eq!(
            out.binding(),
            &Binding::Output {
                node: "update-address".into()
            }
        );
    }

    #[test]
    fn test_repeated_step_requires_explicit_id() {
        let update = step("update");
        let mut b = WorkflowBuilder::new("wf", None);
        b.step(&update, Data::input()).unwrap();

        let err = b.step(&update, Data::input()).unwrap_err();
        assert!(matches!(err, FlowError::Definition(_)));

        b.step_as("update-again", &update, Data::input()).unwrap();
        let err = b.step_as("update-again", &update, Data::input()).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_parallel_group_becomes_one_stage() {
        let (a, b1, b2, c) = (step("a"), step("b1"), step("b2"), step("c"));
        let mut b = WorkflowBuilder::new("wf", None);
        let first = b.step(&a, Data::input()).unwrap();
        let (x, y) = b
            .parallel(|g| {
                let x = g.step(&b1, first.field("id"))?;
                let y = g.step(&b2, first.field("id"))?;
                Ok((x, y))
            })
            .unwrap();
        let last = b.step(&c, Data::array([x, y])).unwrap();

        let graph = b.finish(WorkflowResponse::new(last)).unwrap();
        assert_eq!(
            graph.stages(),
            &[
                Stage::Single(0),
                Stage::Parallel(vec![1, 2]),
                Stage::Single(3)
            ]
        );
    }

    #[test]
    fn test_group_members_cannot_depend_on_each_other() {
        let (a, b1) = (step("a"), step("b1"));
        let mut b = WorkflowBuilder::new("wf", None);
        let err = b
            .parallel(|g| {
                let x = g.step(&a, Data::input())?;
                g.step(&b1, x)
            })
            .unwrap_err();
        assert!(err.to_string().contains("own parallel group"));
    }

    #[test]
    fn test_nested_parallel_is_rejected() {
        let a = step("a");
        let mut b = WorkflowBuilder::new("wf", None);
        let err = b
            .parallel(|g| g.parallel(|inner| inner.step(&a, Data::input())))
            .unwrap_err();
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn test_foreign_placeholder_is_rejected() {
        let a = step("a");
        let mut other = WorkflowBuilder::new("other", None);
        let foreign = other.step(&a, Data::input()).unwrap();

        let mut b = WorkflowBuilder::new("wf", None);
        let err = b.step(&a, foreign).unwrap_err();
        assert!(err.to_string().contains("not part of this workflow"));
    }

    #[test]
    fn test_read_requires_reader() {
        let mut b = WorkflowBuilder::new("wf", None);
        assert!(b.read(ReadStep::new("orders"), Data::input()).is_err());

        let mut b = WorkflowBuilder::new("wf", Some(Arc::new(NullReader)));
        let order = b.read(ReadStep::new("orders"), Data::input()).unwrap();
        assert!(b.read(ReadStep::new("orders"), order.clone()).is_err());
        b.read_as("order-again", ReadStep::new("orders"), order).unwrap();
    }

    #[test]
    fn test_transform_ids_are_explicit() {
        let mut b = WorkflowBuilder::new("wf", None);
        assert!(b
            .transform("a:b", Data::input(), |v: Value| v)
            .is_err());
        assert!(b.transform("", Data::input(), |v: Value| v).is_err());
        b.transform("shape", Data::input(), |v: Value| json!({ "wrapped": v }))
            .unwrap();
    }

    #[test]
    fn test_workflow_is_inlined_with_prefixed_ids() {
        let inner_step = step("update");
        let child = WorkflowDefinition::build(WorkflowInfo::new("child"), None, |b, input| {
            let out = b.step(&inner_step, input.field("address"))?;
            Ok(WorkflowResponse::new(out.field("id")))
        })
        .unwrap()
        .into_handle();

        let first = step("first");
        let mut b = WorkflowBuilder::new("parent", None);
        let seed = b.step(&first, Data::input()).unwrap();
        let out = b.workflow(&child, seed.clone()).unwrap();
        assert!(b.workflow(&child, seed.clone()).is_err());
        b.workflow_as("child-again", &child, seed).unwrap();

        assert_eq!(out.binding().dependencies(), vec!["child:update"]);
        let graph = b.finish(WorkflowResponse::new(out)).unwrap();
        let ids: Vec<&str> = graph.nodes().iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec!["first", "child:update", "child-again:update"]);
        assert_eq!(
            graph.node_by_id("child:update").unwrap().input().dependencies(),
            vec!["first"]
        );
    }

    #[test]
    fn test_workflow_inside_group_is_rejected() {
        let inner = step("inner");
        let child = WorkflowDefinition::build(WorkflowInfo::new("child"), None, |b, input| {
            Ok(WorkflowResponse::new(b.step(&inner, input)?))
        })
        .unwrap()
        .into_handle();

        let mut b = WorkflowBuilder::new("parent", None);
        let err = b
            .parallel(|g| g.workflow(&child, Data::input()))
            .unwrap_err();
        assert!(err.to_string().contains("parallel group"));
    }
}
