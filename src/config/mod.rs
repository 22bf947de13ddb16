// src/config/mod.rs

//! Workspace configuration for flowsched.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a workspace file from disk and anchor its paths (`loader.rs`).
//! - Validate invariants like flow membership and acyclic dependency
//!   expressions (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ActionConfig, ClusterSection, ConfigFile, ConfigSection, RawConfigFile, TaskConfig,
    UnitConfig,
};
