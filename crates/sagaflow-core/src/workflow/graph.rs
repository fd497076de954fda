use std::collections::HashMap;
use std::fmt;
use std::slice;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::binding::Binding;
use super::step::{StepHandle, StepKind};
use crate::error::{FlowError, Result, StepError};

/// Erased pure transformation.
pub type TransformFn = Arc<dyn Fn(Value) -> std::result::Result<Value, StepError> + Send + Sync>;

/// What a node does when it runs.
#[derive(Clone)]
pub enum NodeKind {
    /// Invoke a registered step.
    Step(StepHandle),
    /// Apply a synchronous transformation to the resolved input.
    Transform(TransformFn),
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(step) => f.debug_tuple("Step").field(&step.name()).finish(),
            Self::Transform(_) => f.write_str("Transform"),
        }
    }
}

/// One entry of the workflow graph.
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    kind: NodeKind,
    input: Binding,
    group: Option<usize>,
}

impl Node {
    pub(crate) fn new(id: impl Into<String>, kind: NodeKind, input: Binding, group: Option<usize>) -> Self {
        Self {
            id: id.into(),
            kind,
            input,
            group,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn input(&self) -> &Binding {
        &self.input
    }

    /// Parallel group the node was declared in.
    pub fn group(&self) -> Option<usize> {
        self.group
    }

    /// The step behind the node, unless it is a transform.
    pub fn step(&self) -> Option<&StepHandle> {
        match &self.kind {
            NodeKind::Step(step) => Some(step),
            NodeKind::Transform(_) => None,
        }
    }

    /// Whether rollback invokes anything for this node.
    pub fn is_compensable(&self) -> bool {
        self.step().map(|s| s.is_compensable()).unwrap_or(false)
    }

    pub fn label(&self) -> &'static str {
        match &self.kind {
            NodeKind::Step(step) => match step.kind() {
                StepKind::Action => "action",
                StepKind::Read => "read",
            },
            NodeKind::Transform(_) => "transform",
        }
    }

    pub(crate) fn rebase(&self, id: String, input: Binding, group: Option<usize>) -> Node {
        Node {
            id,
            kind: self.kind.clone(),
            input,
            group,
        }
    }
}

/// A unit of forward progress: one node, or a parallel group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Single(usize),
    Parallel(Vec<usize>),
}

impl Stage {
    /// Node indices of the stage, in declaration order.
    pub fn nodes(&self) -> &[usize] {
        match self {
            Self::Single(index) => slice::from_ref(index),
            Self::Parallel(indices) => indices,
        }
    }
}

/// Validated node arena of a workflow.
///
/// Nodes are stored in declaration order, which is a topological order:
/// a node may only read the outputs of nodes declared before it, and
/// never of a node in its own parallel group.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    stages: Vec<Stage>,
    output: Binding,
}

impl WorkflowGraph {
    pub(crate) fn new(nodes: Vec<Node>, output: Binding) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());

        for (position, node) in nodes.iter().enumerate() {
            for dependency in node.input.dependencies() {
                let Some(&dep) = index.get(&dependency) else {
                    return Err(FlowError::Definition(format!(
                        "node '{}' reads '{}', which is not declared before it",
                        node.id, dependency
                    )));
                };
                let producer: &Node = &nodes[dep];
                if node.group.is_some() && producer.group == node.group {
                    return Err(FlowError::Definition(format!(
                        "node '{}' reads '{}' from its own parallel group",
                        node.id, dependency
                    )));
                }
            }
            if index.insert(node.id.clone(), position).is_some() {
                return Err(FlowError::Definition(format!(
                    "node id '{}' is used more than once",
                    node.id
                )));
            }
        }

        for dependency in output.dependencies() {
            if !index.contains_key(&dependency) {
                return Err(FlowError::Definition(format!(
                    "workflow response reads unknown node '{}'",
                    dependency
                )));
            }
        }

        let stages = plan_stages(&nodes);
        Ok(Self {
            nodes,
            index,
            stages,
            output,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Binding of the workflow response.
    pub fn output(&self) -> &Binding {
        &self.output
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Serializable view of the graph for tooling and logs.
    pub fn describe(&self) -> GraphDescription {
        let nodes = self
            .nodes
            .iter()
            .map(|node| NodeDescription {
                id: node.id.clone(),
                kind: node.label().to_string(),
                step: node.step().map(|s| s.name().to_string()),
                compensable: node.is_compensable(),
                group: node.group,
                depends_on: node.input.dependencies(),
                input: node.input.clone(),
            })
            .collect();
        let stages = self
            .stages
            .iter()
            .map(|stage| {
                stage
                    .nodes()
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect()
            })
            .collect();

        GraphDescription {
            nodes,
            stages,
            output: self.output.clone(),
        }
    }
}

fn plan_stages(nodes: &[Node]) -> Vec<Stage> {
    let mut stages = Vec::new();
    let mut position = 0;
    while position < nodes.len() {
        match nodes[position].group {
            None => {
                stages.push(Stage::Single(position));
                position += 1;
            }
            Some(group) => {
                let members: Vec<usize> = (position..nodes.len())
                    .take_while(|&i| nodes[i].group == Some(group))
                    .collect();
                position += members.len();
                stages.push(Stage::Parallel(members));
            }
        }
    }
    stages
}

/// Serializable description of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub nodes: Vec<NodeDescription>,
    /// Node ids per stage, in execution order.
    pub stages: Vec<Vec<String>>,
    pub output: Binding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub compensable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
    pub depends_on: Vec<String>,
    pub input: Binding,
}
