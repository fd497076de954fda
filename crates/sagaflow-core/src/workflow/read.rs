//! Query-only steps backed by an injected [`EntityReader`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::{StepDefinition, StepHandle};
use crate::error::StepError;

/// Source of entities for read steps.
///
/// The engine passes entry point, filters and fields through untouched;
/// interpreting them is entirely up to the implementation.
#[async_trait]
pub trait EntityReader: Send + Sync + 'static {
    /// Perform a single read. May return one entity, a sequence, or `null`.
    async fn read(&self, request: ReadRequest) -> Result<Value, StepError>;
}

/// Result shaping options of a read step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Return a sequence instead of a single entity.
    #[serde(default)]
    pub list: bool,
    /// Fail with `NotFound` instead of returning `null` or `[]`.
    #[serde(default)]
    pub throw_if_not_found: bool,
}

/// One read handed to an [`EntityReader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub entry_point: String,
    pub filters: Value,
    pub fields: Vec<String>,
    pub options: ReadOptions,
}

/// Declaration of a read step. Filters are the node input.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadStep {
    entry_point: String,
    name: Option<String>,
    fields: Vec<String>,
    options: ReadOptions,
}

impl ReadStep {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            name: None,
            fields: Vec::new(),
            options: ReadOptions::default(),
        }
    }

    /// Override the step name, `read-<entry_point>` by default.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn list(mut self, list: bool) -> Self {
        self.options.list = list;
        self
    }

    pub fn throw_if_not_found(mut self, throw: bool) -> Self {
        self.options.throw_if_not_found = throw;
        self
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn options(&self) -> ReadOptions {
        self.options
    }

    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("read-{}", self.entry_point))
    }

    /// Build the step. It performs exactly one read per invocation and is
    /// never compensated.
    pub fn into_step(self, reader: Arc<dyn EntityReader>) -> StepHandle {
        let name = self.name();
        let description = if self.options.list {
            format!("list {}", self.entry_point)
        } else {
            format!("read one {}", self.entry_point)
        };
        let ReadStep {
            entry_point,
            fields,
            options,
            ..
        } = self;

        StepDefinition::new(name, move |filters: Value, _ctx| {
            let reader = Arc::clone(&reader);
            let entry_point = entry_point.clone();
            let fields = fields.clone();
            async move {
                let filters = match filters {
                    Value::Null => Value::Object(Default::default()),
                    Value::Object(map) => Value::Object(map),
                    _ => {
                        return Err(StepError::validation(format!(
                            "filters for '{}' must be an object",
                            entry_point
                        )))
                    }
                };
                let request = ReadRequest {
                    entry_point,
                    filters,
                    fields,
                    options,
                };
                let result = reader.read(request.clone()).await?;
                shape_result(result, &request)
            }
        })
        .describe(description)
        .into_read()
        .into()
    }
}

/// Apply list/single and not-found semantics to a raw reader result.
pub fn shape_result(result: Value, request: &ReadRequest) -> Result<Value, StepError> {
    let not_found = || StepError::not_found(request.entry_point.clone(), request.filters.clone());

    if request.options.list {
        let items = match result {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        if items.is_empty() && request.options.throw_if_not_found {
            return Err(not_found());
        }
        Ok(Value::Array(items))
    } else {
        let entity = match result {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        };
        if entity.is_null() && request.options.throw_if_not_found {
            return Err(not_found());
        }
        Ok(entity)
    }
}
