// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::depend::DependencyError;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the persistent job table.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("unknown job status '{0}' in store")]
    UnknownStatus(String),

    #[error("unknown backend '{0}' in store")]
    UnknownBackend(String),

    #[error("job {0} not found")]
    JobNotFound(uuid::Uuid),
}

/// Failures talking to a cluster scheduler or spawning local processes.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("submission produced no output")]
    EmptySubmission,

    #[error("could not parse job id from submission output: {0}")]
    MalformedJobId(String),

    #[error("status query `{command}` failed: {detail}")]
    Query { command: String, detail: String },

    #[error("failed to kill job {job_id}: {detail}")]
    Kill { job_id: String, detail: String },
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowError>;
