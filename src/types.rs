use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Running,
    Killing,
    Killed,
    Cancelled,
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    /// Never scheduled in this session.
    Undefined,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Running => "Running",
            TaskStatus::Killing => "Killing",
            TaskStatus::Killed => "Killed",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Pass => "PASS",
            TaskStatus::Fail => "FAIL",
            TaskStatus::Undefined => "undefined",
        }
    }

    /// Whether the task can no longer change status within this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Killed | TaskStatus::Cancelled | TaskStatus::Pass | TaskStatus::Fail
        )
    }

    /// Whether a task is currently occupying a backend slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Killing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Queued" => Ok(TaskStatus::Queued),
            "Running" => Ok(TaskStatus::Running),
            "Killing" => Ok(TaskStatus::Killing),
            "Killed" => Ok(TaskStatus::Killed),
            "Cancelled" => Ok(TaskStatus::Cancelled),
            "PASS" => Ok(TaskStatus::Pass),
            "FAIL" => Ok(TaskStatus::Fail),
            "undefined" => Ok(TaskStatus::Undefined),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// Execution policy of one (block, version, flow, vendor, branch) group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Fail-stop chain in declaration order.
    #[default]
    Serial,
    /// Independent members joined at the end.
    Parallel,
}

/// Where a job's command executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Cluster batch scheduler (`bsub` / `bjobs` / `bkill`).
    Cluster,
    /// Plain local subprocess.
    #[default]
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Cluster => "cluster",
            BackendKind::Local => "local",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cluster" | "lsf" => Ok(BackendKind::Cluster),
            "local" => Ok(BackendKind::Local),
            other => Err(format!("invalid backend: {other} (expected \"cluster\" or \"local\")")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One of the independent command slots a task can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Build,
    Run,
    Check,
    Summarize,
    Release,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Build,
        Action::Run,
        Action::Check,
        Action::Summarize,
        Action::Release,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Build => "build",
            Action::Run => "run",
            Action::Check => "check",
            Action::Summarize => "summarize",
            Action::Release => "release",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.as_str().to_uppercase())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "build" => Ok(Action::Build),
            "run" => Ok(Action::Run),
            "check" => Ok(Action::Check),
            "summarize" => Ok(Action::Summarize),
            "release" => Ok(Action::Release),
            other => Err(format!("invalid action: {other}")),
        }
    }
}

/// Status vocabulary of the persistent job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    AwaitingDispatch,
    Dispatching,
    Dispatched,
    Queued,
    Running,
    Passed,
    Failed,
    Undefined,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::AwaitingDispatch => "awaiting_dispatch",
            JobStatus::Dispatching => "dispatching",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Passed => "passed",
            JobStatus::Failed => "failed",
            JobStatus::Undefined => "undefined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_dispatch" => Some(JobStatus::AwaitingDispatch),
            "dispatching" => Some(JobStatus::Dispatching),
            "dispatched" => Some(JobStatus::Dispatched),
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "passed" => Some(JobStatus::Passed),
            "failed" => Some(JobStatus::Failed),
            "undefined" => Some(JobStatus::Undefined),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Passed | JobStatus::Failed)
    }

    /// Statuses the watcher is responsible for reconciling.
    pub const WATCHED: [JobStatus; 4] = [
        JobStatus::Dispatched,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Undefined,
    ];

    /// Statuses removed from the store at process start.
    pub const PURGED_AT_STARTUP: [JobStatus; 5] = [
        JobStatus::AwaitingDispatch,
        JobStatus::Dispatching,
        JobStatus::Dispatched,
        JobStatus::Queued,
        JobStatus::Undefined,
    ];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_strings_round_trip() {
        for status in [
            JobStatus::AwaitingDispatch,
            JobStatus::Dispatching,
            JobStatus::Dispatched,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Passed,
            JobStatus::Failed,
            JobStatus::Undefined,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_task_statuses() {
        assert!(TaskStatus::Pass.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Killing.is_terminal());
        assert!(TaskStatus::Killing.is_active());
        assert!(!TaskStatus::Queued.is_active());
    }
}
