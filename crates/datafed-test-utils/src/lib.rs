//! Shared test utilities for DataFed task tests.
//!
//! This crate provides:
//! - [`World`]: a task service over an in-memory store, plus builders for
//!   users, projects, repositories, allocations, collections and records
//! - [`ScriptedExecutor`]: a command executor with scripted and seeded
//!   random failures
//! - Assertion helpers for task state, allocation counters and lock edges
//!
//! # Example
//!
//! ```rust,ignore
//! use datafed_test_utils::{World, assert_task_status};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let world = World::new();
//!     let alice = world.user("alice");
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod simulation;

pub use assertions::*;
pub use fixtures::*;
pub use simulation::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("datafed_tasks=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
