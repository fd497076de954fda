//! Testing utilities for sagaflow workflows.
//!
//! Enabled with the `testing` feature. Provides assertion macros, an
//! in-memory [`MockReader`] for read steps and a [`CallLog`] for checking
//! the order in which forward and compensation functions ran.
//!
//! # Example
//!
//! ```ignore
//! use sagaflow::prelude::*;
//! use sagaflow::testing::*;
//!
//! #[tokio::test]
//! async fn test_rollback_order() {
//!     let log = CallLog::new();
//!     // ... define steps that call log.record(..)
//!     let result = engine.run(&workflow, json!({})).await.result;
//!     assert_err_kind!(result, ErrorKind::StepExecution);
//!     log.assert_order(&["a", "b", "undo-b", "undo-a"]);
//! }
//! ```

pub mod assertions;
pub mod call_log;
pub mod mock_reader;

pub use assertions::*;
pub use call_log::CallLog;
pub use mock_reader::MockReader;

use std::time::Duration;

/// Default timeout for a workflow run under test.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);
