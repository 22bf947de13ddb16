// src/backend/mod.rs

//! Execution backends.
//!
//! The dispatcher submits through [`Backend::submit`], the watcher polls with
//! [`Backend::query`] and the scheduler stops jobs with [`Backend::kill`].
//! Tests swap in a fake implementation from `flowsched-test-utils`.

pub mod cluster;
pub mod local;
pub mod predict;
pub mod result_file;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::BackendError;
use crate::store::JobRecord;
use crate::types::{Action, BackendKind, JobStatus};

pub use cluster::ClusterBackend;
pub use local::LocalBackend;
pub use predict::MemoryPredictor;

/// What a backend reports for one of its jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    /// Accepted but not started (cluster PEND / PSUSP / QUEUE).
    Pending,
    Running,
    /// Finished successfully.
    Done,
    /// Finished with a failure, exit code when known.
    Exit(Option<i32>),
    /// Any other backend-specific state; leaves the job unchanged.
    Other(String),
}

/// Translate a backend report into a job status; `None` means "leave as is".
pub fn map_backend_state(state: &BackendState) -> Option<(JobStatus, Option<i32>)> {
    match state {
        BackendState::Pending => Some((JobStatus::Queued, None)),
        BackendState::Running => Some((JobStatus::Running, None)),
        BackendState::Done => Some((JobStatus::Passed, Some(0))),
        BackendState::Exit(code) => Some((JobStatus::Failed, *code)),
        BackendState::Other(_) => None,
    }
}

/// Everything a backend needs to launch one job.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: JobRecord,
    /// Identity bindings exported to the job's environment.
    pub env: Vec<(String, String)>,
    /// Where the job's stdout/stderr go.
    pub log_path: PathBuf,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Launch a job and return its backend id.
    async fn submit(&self, submission: &Submission) -> Result<String, BackendError>;

    /// Batched status query. Ids missing from the result are unknown to the
    /// backend.
    async fn query(&self, job_ids: &[String]) -> Result<HashMap<String, BackendState>, BackendError>;

    async fn kill(&self, job_id: &str) -> Result<(), BackendError>;
}

/// The two backends, selected by a job's [`BackendKind`].
#[derive(Clone)]
pub struct Backends {
    pub cluster: Arc<dyn Backend>,
    pub local: Arc<dyn Backend>,
}

impl Backends {
    pub fn new(cluster: Arc<dyn Backend>, local: Arc<dyn Backend>) -> Self {
        Self { cluster, local }
    }

    pub fn get(&self, kind: BackendKind) -> &Arc<dyn Backend> {
        match kind {
            BackendKind::Cluster => &self.cluster,
            BackendKind::Local => &self.local,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

pub const ENV_BLOCK: &str = "FLOWSCHED_BLOCK";
pub const ENV_VERSION: &str = "FLOWSCHED_VERSION";
pub const ENV_FLOW: &str = "FLOWSCHED_FLOW";
pub const ENV_TASK: &str = "FLOWSCHED_TASK";
pub const ENV_ACTION: &str = "FLOWSCHED_ACTION";
pub const ENV_RESULT_FILE: &str = "FLOWSCHED_RESULT_FILE";

/// Environment binding a job's identity for the command it runs.
pub fn job_environment(job: &JobRecord, result_root: &Path) -> Vec<(String, String)> {
    let result = result_file::result_path(
        result_root,
        &job.block,
        &job.version,
        &job.task,
        job.action,
    );
    vec![
        (ENV_BLOCK.to_string(), job.block.clone()),
        (ENV_VERSION.to_string(), job.version.clone()),
        (ENV_FLOW.to_string(), job.flow.clone()),
        (ENV_TASK.to_string(), job.task.clone()),
        (ENV_ACTION.to_string(), job.action.to_string()),
        (
            ENV_RESULT_FILE.to_string(),
            result.to_string_lossy().into_owned(),
        ),
    ]
}

/// `<log_dir>/<block>/<version>/<task>.<action>.log`
pub fn default_log_path(
    log_dir: &Path,
    block: &str,
    version: &str,
    task: &str,
    action: Action,
) -> PathBuf {
    log_dir
        .join(block)
        .join(version)
        .join(format!("{task}.{}.log", action.as_str()))
}

/// Log file of a job: the stored one, else the default location.
pub fn job_log_path(log_dir: &Path, job: &JobRecord) -> PathBuf {
    job.log_path.clone().unwrap_or_else(|| {
        default_log_path(log_dir, &job.block, &job.version, &job.task, job.action)
    })
}

/// A job of task `task` in unit cpu/v1, logging under `dir`.
#[cfg(test)]
pub(crate) fn sample_submission(dir: &Path, task: &str, command: &str) -> Submission {
    Submission {
        job: JobRecord {
            uuid: uuid::Uuid::new_v4(),
            job_id: None,
            backend: BackendKind::Local,
            block: "cpu".into(),
            version: "v1".into(),
            flow: "syn".into(),
            task: task.into(),
            action: Action::Run,
            status: JobStatus::Dispatching,
            command: command.into(),
            cwd: dir.to_path_buf(),
            log_path: None,
            exit_code: None,
            created_time: chrono::Utc::now(),
            submitted_time: None,
            finished_time: None,
        },
        env: vec![],
        log_path: dir.join(format!("{task}.run.log")),
    }
}
