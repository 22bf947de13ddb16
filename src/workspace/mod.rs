// src/workspace/mod.rs

//! The validated workspace: a typed arena of tasks keyed by
//! `(block, version, flow, task)`, the dependency engine and the live
//! status board.

pub mod board;
pub mod model;

pub use board::{StatusBoard, TaskState};
pub use model::{GroupKey, ResolvedAction, TaskGroup, TaskKey, TaskSpec, Unit, Workspace};
