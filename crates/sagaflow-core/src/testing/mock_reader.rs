//! In-memory [`EntityReader`] for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StepError;
use crate::workflow::{EntityReader, ReadRequest};

/// Entity reader backed by fixtures.
///
/// Filters match entity fields by equality; an array filter value matches
/// any of its elements. Dotted filter keys address nested fields. When
/// fields are requested, only their top-level keys are returned.
///
/// ```ignore
/// let reader = MockReader::new()
///     .with_entities("return", vec![json!({"id": "ret_1", "order_id": "ord_1"})]);
/// ```
#[derive(Default)]
pub struct MockReader {
    entities: RwLock<HashMap<String, Vec<Value>>>,
    failures: RwLock<HashMap<String, StepError>>,
    requests: RwLock<Vec<ReadRequest>>,
}

impl MockReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add fixtures for an entry point.
    pub fn with_entities(self, entry_point: &str, entities: Vec<Value>) -> Self {
        self.insert(entry_point, entities);
        self
    }

    /// Make every read of `entry_point` fail with `error`.
    pub fn with_failure(self, entry_point: &str, error: StepError) -> Self {
        write_lock(&self.failures).insert(entry_point.to_string(), error);
        self
    }

    pub fn insert(&self, entry_point: &str, entities: Vec<Value>) {
        write_lock(&self.entities)
            .entry(entry_point.to_string())
            .or_default()
            .extend(entities);
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ReadRequest> {
        read_lock(&self.requests).clone()
    }

    pub fn requests_for(&self, entry_point: &str) -> Vec<ReadRequest> {
        read_lock(&self.requests)
            .iter()
            .filter(|r| r.entry_point == entry_point)
            .cloned()
            .collect()
    }

    /// Assert that `entry_point` was read exactly `times` times.
    pub fn assert_read(&self, entry_point: &str, times: usize) {
        let count = self.requests_for(entry_point).len();
        assert_eq!(
            count, times,
            "Expected {} read(s) of '{}', got {}",
            times, entry_point, count
        );
    }
}

#[async_trait]
impl EntityReader for MockReader {
    async fn read(&self, request: ReadRequest) -> Result<Value, StepError> {
        write_lock(&self.requests).push(request.clone());

        if let Some(error) = read_lock(&self.failures).get(&request.entry_point) {
            return Err(error.clone());
        }

        let entities = read_lock(&self.entities);
        let matches = entities
            .get(&request.entry_point)
            .map(|all| {
                all.iter()
                    .filter(|entity| matches_filters(entity, &request.filters))
                    .map(|entity| project(entity, &request.fields))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Value::Array(matches))
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lookup<'a>(entity: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(entity, |value, segment| value.get(segment))
}

fn matches_filters(entity: &Value, filters: &Value) -> bool {
    let Some(filters) = filters.as_object() else {
        return true;
    };
    filters.iter().all(|(key, expected)| {
        let actual = lookup(entity, key).unwrap_or(&Value::Null);
        match expected {
            Value::Array(options) => options.contains(actual),
            other => actual == other,
        }
    })
}

fn project(entity: &Value, fields: &[String]) -> Value {
    let Some(object) = entity.as_object() else {
        return entity.clone();
    };
    if fields.is_empty() || fields.iter().any(|f| f == "*") {
        return entity.clone();
    }

    let mut projected = Map::new();
    for field in fields {
        let key = field.split('.').next().unwrap_or(field);
        if let Some(value) = object.get(key) {
            projected.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(projected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ReadOptions;
    use serde_json::json;

    fn request(entry_point: &str, filters: Value, fields: &[&str]) -> ReadRequest {
        ReadRequest {
            entry_point: entry_point.into(),
            filters,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            options: ReadOptions::default(),
        }
    }

    fn reader() -> MockReader {
        MockReader::new().with_entities(
            "order_change_action",
            vec![
                json!({"id": "act_1", "status": "pending", "details": {"reference": "ret_1"}}),
                json!({"id": "act_2", "status": "requested", "details": {"reference": "ret_1"}}),
                json!({"id": "act_3", "status": "canceled", "details": {"reference": "ret_2"}}),
            ],
        )
    }

    #[tokio::test]
    async fn test_array_filter_matches_any() {
        let reader = reader();
        let result = reader
            .read(request(
                "order_change_action",
                json!({"status": ["pending", "requested"]}),
                &["id"],
            ))
            .await
            .unwrap();

        assert_eq!(result, json!([{"id": "act_1"}, {"id": "act_2"}]));
    }

    #[tokio::test]
    async fn test_nested_filter_and_projection() {
        let reader = reader();
        let result = reader
            .read(request(
                "order_change_action",
                json!({"details.reference": "ret_2"}),
                &["id", "details.reference"],
            ))
            .await
            .unwrap();

        assert_eq!(
            result,
            json!([{"id": "act_3", "details": {"reference": "ret_2"}}])
        );
    }

    #[tokio::test]
    async fn test_unknown_entry_point_is_empty_and_requests_are_recorded() {
        let reader = reader();
        let result = reader
            .read(request("orders", json!({"id": "x"}), &[]))
            .await
            .unwrap();

        assert_eq!(result, json!([]));
        reader.assert_read("orders", 1);
        reader.assert_read("order_change_action", 0);
        assert_eq!(reader.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let reader = MockReader::new().with_failure("orders", StepError::failed("db down"));
        let err = reader
            .read(request("orders", json!({}), &[]))
            .await
            .unwrap_err();
        assert_eq!(err, StepError::failed("db down"));
    }
}
