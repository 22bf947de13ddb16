// src/depend/mod.rs

//! Dependency expression engine.
//!
//! - [`expr`] parses the `,` / `|` / `&` language into a typed tree and
//!   implements cleaning and runtime evaluation.
//! - [`graph`] compiles a unit's expressions into a DAG with synthetic
//!   AND/OR nodes, checks acyclicity and enumerates dependency paths.
//! - [`validate`] holds the duplicate-condition check.
//! - [`engine`] keeps the validated state of every (block, version) and
//!   applies changes atomically.

pub mod engine;
pub mod expr;
pub mod graph;
pub mod validate;

use thiserror::Error;

pub use engine::{DependencyEngine, UnitDependencies};
pub use expr::{DepExpr, DepState, Readiness, clean, parse};
pub use graph::{DependencyGraph, NodeId, compile, find_cycle, find_paths_to, validate_acyclic};
pub use validate::{find_duplicate_condition, validate_no_duplicate_conditions};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("invalid task name '{token}' in dependency expression '{expr}'")]
    InvalidToken { expr: String, token: String },

    #[error("task {task} in {block}/{version} depends on unknown task {dependency}")]
    UnknownTask {
        block: String,
        version: String,
        task: String,
        dependency: String,
    },

    #[error("dependency cycle in {block}/{version} involving {node}")]
    Cycle {
        block: String,
        version: String,
        node: String,
    },

    #[error("task {task} lists the same alternative twice in '{condition}'")]
    DuplicateCondition { task: String, condition: String },

    #[error("no dependency state registered for {block}/{version}")]
    UnknownUnit { block: String, version: String },
}
