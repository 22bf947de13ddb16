// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{Action, BackendKind, RunType, TaskStatus};

/// Workspace file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// job_store = ".flowsched/jobs.db"
/// fail_fast = true
///
/// [cluster]
/// queue = "normal"
///
/// [[unit]]
/// block = "cpu"
/// version = "v1"
/// run_order = ["syn", "sta|pv"]
///
/// [[unit.task]]
/// name = "synth"
/// flow = "syn"
///
/// [unit.task.action.run]
/// command = "make synth"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub unit: Vec<UnitConfig>,
}

/// Validated workspace configuration.
///
/// Only obtainable through `TryFrom<RawConfigFile>`, so holders can rely on
/// unique units, known flows and acyclic dependency expressions.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub cluster: ClusterSection,
    pub unit: Vec<UnitConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        config: ConfigSection,
        cluster: ClusterSection,
        unit: Vec<UnitConfig>,
    ) -> Self {
        Self {
            config,
            cluster,
            unit,
        }
    }
}

/// `[config]` section: store locations, scheduling policy and loop timings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// SQLite file backing the job store.
    #[serde(default = "default_job_store")]
    pub job_store: PathBuf,

    /// Directory for per-job stdout/stderr logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Root of the per-task result files.
    #[serde(default = "default_result_root")]
    pub result_root: PathBuf,

    /// Cancel later bundles once a bundle ends with a failure-class task.
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// Keep running a serial group after a member fails.
    #[serde(default)]
    pub ignore_fail: bool,

    /// Terminal statuses that count as failures for bundle cancellation, in
    /// addition to Killed, Killing and Cancelled.
    #[serde(default = "default_run_fail_markers")]
    pub run_fail_markers: Vec<TaskStatus>,

    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    /// How often a launched task re-reads its job row.
    #[serde(default = "default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,

    /// Size of the submission worker pool.
    #[serde(default = "default_submit_workers")]
    pub submit_workers: usize,

    /// How long a dispatched job may lack a backend id before the watcher
    /// gives up on it.
    #[serde(default = "default_orphan_grace_ms")]
    pub orphan_grace_ms: u64,
}

impl ConfigSection {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }
}

fn default_job_store() -> PathBuf {
    PathBuf::from(".flowsched/jobs.db")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".flowsched/logs")
}

fn default_result_root() -> PathBuf {
    PathBuf::from(".flowsched/results")
}

fn default_true() -> bool {
    true
}

fn default_run_fail_markers() -> Vec<TaskStatus> {
    vec![TaskStatus::Fail]
}

fn default_dispatch_interval_ms() -> u64 {
    1_000
}

fn default_watch_interval_ms() -> u64 {
    5_000
}

fn default_task_poll_interval_ms() -> u64 {
    500
}

fn default_submit_workers() -> usize {
    8
}

fn default_orphan_grace_ms() -> u64 {
    30_000
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            job_store: default_job_store(),
            log_dir: default_log_dir(),
            result_root: default_result_root(),
            fail_fast: true,
            ignore_fail: false,
            run_fail_markers: default_run_fail_markers(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            watch_interval_ms: default_watch_interval_ms(),
            task_poll_interval_ms: default_task_poll_interval_ms(),
            submit_workers: default_submit_workers(),
            orphan_grace_ms: default_orphan_grace_ms(),
        }
    }
}

/// `[cluster]` section: the batch scheduler's command line.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_submit")]
    pub submit: String,

    #[serde(default = "default_status")]
    pub status: String,

    #[serde(default = "default_kill")]
    pub kill: String,

    #[serde(default)]
    pub queue: Option<String>,

    /// Resource request passed with `-R`, e.g. `rusage[mem=4000]`.
    #[serde(default)]
    pub resources: Option<String>,

    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Regex with one capture group extracting the job id from the first
    /// line of submission output.
    #[serde(default = "default_job_id_pattern")]
    pub job_id_pattern: String,

    /// External command predicting a job's memory need, in MB.
    #[serde(default)]
    pub memory_predictor: Option<String>,
}

fn default_submit() -> String {
    "bsub".to_string()
}

fn default_status() -> String {
    "bjobs".to_string()
}

fn default_kill() -> String {
    "bkill".to_string()
}

fn default_job_id_pattern() -> String {
    r"Job <(\d+)>".to_string()
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            submit: default_submit(),
            status: default_status(),
            kill: default_kill(),
            queue: None,
            resources: None,
            extra_args: Vec::new(),
            job_id_pattern: default_job_id_pattern(),
            memory_predictor: None,
        }
    }
}

/// `[[unit]]`: one (block, version) with its run order and tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    pub block: String,
    pub version: String,

    /// Bundles in execution order; flows inside a bundle are `|`-joined.
    pub run_order: Vec<String>,

    /// Tasks in declaration order (serial groups keep this order).
    #[serde(default)]
    pub task: Vec<TaskConfig>,
}

impl UnitConfig {
    /// The run order split into bundles of flow names.
    pub fn bundles(&self) -> Vec<Vec<String>> {
        self.run_order
            .iter()
            .map(|bundle| {
                bundle
                    .split('|')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .collect()
    }
}

/// `[[unit.task]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub flow: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub branch: String,

    #[serde(default)]
    pub run_type: RunType,

    /// Default backend for actions that do not set `run_method`.
    #[serde(default)]
    pub backend: BackendKind,

    /// Dependency expression over task names of the same unit.
    #[serde(default)]
    pub run_after: String,

    #[serde(default)]
    pub action: BTreeMap<Action, ActionConfig>,
}

/// `[unit.task.action.<name>]`: one command slot.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    pub command: String,

    /// Working directory; defaults to the workspace directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Overrides the task's backend for this action.
    #[serde(default)]
    pub run_method: Option<BackendKind>,
}
