//! Planning-time placeholders for run-time values.
//!
//! While a workflow is being defined nothing has run yet, so step outputs
//! are represented by [`Data`] placeholders. Each placeholder wraps a
//! [`Binding`], a small serializable expression over the workflow input
//! and node outputs that the orchestrator evaluates against the execution
//! context when the consuming node runs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::ExecutionContext;
use crate::error::StepError;

/// Expression describing where a node's input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    /// The whole workflow input.
    Input,
    /// The whole output of a node.
    Output { node: String },
    /// A nested field of another binding. Missing fields resolve to `null`.
    Field { base: Box<Binding>, path: Vec<String> },
    /// An object assembled from other bindings.
    Object { fields: IndexMap<String, Binding> },
    /// An array assembled from other bindings.
    Array { items: Vec<Binding> },
    /// A constant.
    Literal { value: Value },
}

impl Binding {
    /// Nodes whose outputs this binding reads, in first-use order.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        self.collect_dependencies(&mut deps);
        deps
    }

    fn collect_dependencies(&self, deps: &mut Vec<String>) {
        match self {
            Binding::Output { node } => {
                if !deps.contains(node) {
                    deps.push(node.clone());
                }
            }
            Binding::Field { base, .. } => base.collect_dependencies(deps),
            Binding::Object { fields } => {
                for binding in fields.values() {
                    binding.collect_dependencies(deps);
                }
            }
            Binding::Array { items } => {
                for binding in items {
                    binding.collect_dependencies(deps);
                }
            }
            Binding::Input | Binding::Literal { .. } => {}
        }
    }

    /// Whether the binding reads the workflow input.
    pub fn reads_input(&self) -> bool {
        match self {
            Binding::Input => true,
            Binding::Field { base, .. } => base.reads_input(),
            Binding::Object { fields } => fields.values().any(Binding::reads_input),
            Binding::Array { items } => items.iter().any(Binding::reads_input),
            Binding::Output { .. } | Binding::Literal { .. } => false,
        }
    }

    /// Evaluate against the outputs recorded so far.
    pub fn resolve(&self, ctx: &ExecutionContext) -> Result<Value, StepError> {
        match self {
            Binding::Input => Ok(ctx.input().clone()),
            Binding::Output { node } => ctx.output(node).cloned().ok_or_else(|| {
                StepError::failed(format!("output of node '{}' is not available", node))
            }),
            Binding::Field { base, path } => {
                let value = base.resolve(ctx)?;
                Ok(select(&value, path))
            }
            Binding::Object { fields } => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, binding) in fields {
                    map.insert(key.clone(), binding.resolve(ctx)?);
                }
                Ok(Value::Object(map))
            }
            Binding::Array { items } => items
                .iter()
                .map(|b| b.resolve(ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Binding::Literal { value } => Ok(value.clone()),
        }
    }

    /// Rewrite for inlining into another graph: `Input` becomes `input`,
    /// node references go through `rename`.
    pub(crate) fn rebase(&self, input: &Binding, rename: &dyn Fn(&str) -> String) -> Binding {
        match self {
            Binding::Input => input.clone(),
            Binding::Output { node } => Binding::Output {
                node: rename(node),
            },
            Binding::Field { base, path } => Binding::Field {
                base: Box::new(base.rebase(input, rename)),
                path: path.clone(),
            },
            Binding::Object { fields } => Binding::Object {
                fields: fields
                    .iter()
                    .map(|(k, b)| (k.clone(), b.rebase(input, rename)))
                    .collect(),
            },
            Binding::Array { items } => Binding::Array {
                items: items.iter().map(|b| b.rebase(input, rename)).collect(),
            },
            Binding::Literal { value } => Binding::Literal {
                value: value.clone(),
            },
        }
    }
}

fn select(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Placeholder for a value that exists only once the workflow runs.
///
/// ```ignore
/// let order_return = b.read(ReadStep::new("return").throw_if_not_found(true),
///     Data::object([("id", input.field("return_id"))]))?;
/// let order = b.read_as("order-query", ReadStep::new("orders"),
///     Data::object([("id", order_return.field("order_id"))]))?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    binding: Binding,
}

impl Data {
    pub(crate) fn new(binding: Binding) -> Self {
        Self { binding }
    }

    pub(crate) fn input() -> Self {
        Self::new(Binding::Input)
    }

    pub(crate) fn output(node: impl Into<String>) -> Self {
        Self::new(Binding::Output { node: node.into() })
    }

    /// A constant value.
    pub fn literal(value: Value) -> Self {
        Self::new(Binding::Literal { value })
    }

    /// Project a field.
    pub fn field(&self, name: &str) -> Data {
        match &self.binding {
            Binding::Field { base, path } => {
                let mut path = path.clone();
                path.push(name.to_string());
                Data::new(Binding::Field {
                    base: base.clone(),
                    path,
                })
            }
            other => Data::new(Binding::Field {
                base: Box::new(other.clone()),
                path: vec![name.to_string()],
            }),
        }
    }

    /// Project a dotted path such as `"shipping_address.city"`.
    pub fn path(&self, dotted: &str) -> Data {
        dotted
            .split('.')
            .filter(|s| !s.is_empty())
            .fold(self.clone(), |data, segment| data.field(segment))
    }

    /// Assemble an object from named placeholders.
    pub fn object<I, K>(fields: I) -> Data
    where
        I: IntoIterator<Item = (K, Data)>,
        K: Into<String>,
    {
        Data::new(Binding::Object {
            fields: fields
                .into_iter()
                .map(|(k, d)| (k.into(), d.binding))
                .collect(),
        })
    }

    /// Assemble an array from placeholders.
    pub fn array(items: impl IntoIterator<Item = Data>) -> Data {
        Data::new(Binding::Array {
            items: items.into_iter().map(|d| d.binding).collect(),
        })
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn into_binding(self) -> Binding {
        self.binding
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Data::literal(value)
    }
}

impl From<&Data> for Data {
    fn from(data: &Data) -> Self {
        data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            Uuid::new_v4(),
            "test",
            json!({"return_id": "ret_1", "action_id": "act_9"}),
        );
        ctx.record(
            "read-return",
            json!({"id": "ret_1", "order_id": "ord_1", "items": [{"id": "li_1"}]}),
        )
        .unwrap();
        ctx
    }

    #[test]
    fn test_resolve_input_and_fields() {
        let ctx = context();
        assert_eq!(Data::input().field("return_id").binding().resolve(&ctx).unwrap(), json!("ret_1"));
        assert_eq!(
            Data::output("read-return")
                .path("items.0.id")
                .binding()
                .resolve(&ctx)
                .unwrap(),
            json!("li_1")
        );
    }

    #[test]
    fn test_missing_field_resolves_to_null() {
        let ctx = context();
        let value = Data::output("read-return")
            .path("customer.email")
            .binding()
            .resolve(&ctx)
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let ctx = context();
        assert!(Data::output("never-ran").binding().resolve(&ctx).is_err());
    }

    #[test]
    fn test_object_and_array_assembly() {
        let ctx = context();
        let data = Data::object([
            ("order_id", Data::output("read-return").field("order_id")),
            ("ids", Data::array([Data::input().field("action_id")])),
            ("status", Data::literal(json!(["pending", "requested"]))),
        ]);

        assert_eq!(
            data.binding().resolve(&ctx).unwrap(),
            json!({
                "order_id": "ord_1",
                "ids": ["act_9"],
                "status": ["pending", "requested"]
            })
        );
    }

    #[test]
    fn test_dependencies_are_deduplicated() {
        let data = Data::object([
            ("a", Data::output("x").field("id")),
            ("b", Data::output("y")),
            ("c", Data::output("x")),
            ("d", Data::input()),
        ]);

        assert_eq!(data.binding().dependencies(), vec!["x", "y"]);
        assert!(data.binding().reads_input());
        assert!(!Data::output("x").binding().reads_input());
    }

    #[test]
    fn test_rebase_for_inlining() {
        let data = Data::object([("a", Data::input().field("id")), ("b", Data::output("inner"))]);
        let replacement = Data::output("outer").field("payload").into_binding();
        let rebased = data
            .binding()
            .rebase(&replacement, &|node| format!("child:{}", node));

        assert_eq!(rebased.dependencies(), vec!["outer", "child:inner"]);
    }
}
