//! Assertion macros and helpers for workflow results.

use crate::error::{FlowError, StepError};

/// Assert that a result is Ok.
///
/// ```ignore
/// assert_ok!(engine.run(&workflow, input).await.result);
/// assert_ok!(result, "update-address should succeed");
/// ```
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: expected Ok, got Err({:?})", e),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: {}: expected Ok, got Err({:?})", format_args!($($arg)+), e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match &$expr {
            Err(_) => (),
            Ok(v) => panic!("assertion failed: expected Err, got Ok({:?})", v),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match &$expr {
            Err(_) => (),
            Ok(v) => panic!("assertion failed: {}: expected Err, got Ok({:?})", format_args!($($arg)+), v),
        }
    };
}

/// Assert that a `FlowError` result has the given [`ErrorKind`](crate::error::ErrorKind).
///
/// ```ignore
/// assert_err_kind!(result, ErrorKind::CompositeFailure);
/// ```
#[macro_export]
macro_rules! assert_err_kind {
    ($expr:expr, $kind:expr) => {
        match &$expr {
            Err(e) if e.kind() == $kind => (),
            Err(e) => panic!(
                "assertion failed: expected error kind {}, got {} ({})",
                $kind,
                e.kind(),
                e
            ),
            Ok(v) => panic!(
                "assertion failed: expected Err({}), got Ok({:?})",
                $kind, v
            ),
        }
    };
}

/// Check if an error message contains a substring.
pub fn error_contains(error: &FlowError, substring: &str) -> bool {
    error.to_string().contains(substring)
}

/// The step error that aborted a run, if the error carries one.
pub fn trigger_error(error: &FlowError) -> Option<&StepError> {
    error.trigger().map(|failure| &failure.error)
}

/// Partial JSON match: objects in `pattern` only need to be a subset of
/// `actual`, arrays must match element-wise.
pub fn json_matches(actual: &serde_json::Value, pattern: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (actual, pattern) {
        (Value::Object(a), Value::Object(p)) => p.iter().all(|(key, expected)| {
            a.get(key)
                .map(|value| json_matches(value, expected))
                .unwrap_or(false)
        }),
        (Value::Array(a), Value::Array(p)) => {
            a.len() == p.len() && a.iter().zip(p).all(|(a, p)| json_matches(a, p))
        }
        (a, p) => a == p,
    }
}
