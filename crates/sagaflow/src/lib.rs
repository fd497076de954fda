//! sagaflow - saga-style workflow orchestration for Rust
//!
//! Define steps with optional compensations, compose them into workflows,
//! and run them. When a step fails, every step that already completed is
//! compensated in reverse order.

mod runtime;

#[doc(hidden)]
pub use sagaflow_core;
#[doc(hidden)]
pub use sagaflow_runtime;

pub use sagaflow_runtime::init_tracing;

#[cfg(feature = "testing")]
pub use sagaflow_core::testing;

#[cfg(feature = "testing")]
pub use sagaflow_core::{assert_err, assert_err_kind, assert_ok};

pub use runtime::prelude;
pub use runtime::{open_store, Engine, EngineBuilder, RunResult};
