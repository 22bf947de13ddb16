// src/scheduler/summary.rs

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::types::TaskStatus;
use crate::workspace::{TaskKey, Workspace};

/// Killed, Killing and Cancelled always count as failures; `markers` adds
/// the configured run-fail statuses.
pub fn is_failure_class(status: TaskStatus, markers: &[TaskStatus]) -> bool {
    matches!(
        status,
        TaskStatus::Killed | TaskStatus::Killing | TaskStatus::Cancelled
    ) || markers.contains(&status)
}

/// Final state of every selected task after a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tasks: Vec<(TaskKey, TaskStatus, Option<Duration>)>,
}

impl RunSummary {
    pub(crate) fn collect(ws: &Workspace, selected: &HashSet<TaskKey>) -> Self {
        let mut tasks: Vec<_> = selected
            .iter()
            .map(|key| {
                let state = ws.board.state(key).unwrap_or_default();
                (key.clone(), state.status, state.runtime)
            })
            .collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        Self { tasks }
    }

    pub fn status(&self, key: &TaskKey) -> Option<TaskStatus> {
        self.tasks
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, status, _)| *status)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|(_, s, _)| *s == status).count()
    }

    /// Tasks that ended failure-class.
    pub fn failures(&self, markers: &[TaskStatus]) -> Vec<&TaskKey> {
        self.tasks
            .iter()
            .filter(|(_, status, _)| is_failure_class(*status, markers))
            .map(|(key, _, _)| key)
            .collect()
    }

    pub fn is_success(&self, markers: &[TaskStatus]) -> bool {
        self.failures(markers).is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, status, runtime) in &self.tasks {
            let runtime = runtime
                .map(|d| format!("{:.1}s", d.as_secs_f64()))
                .unwrap_or_else(|| "-".to_string());
            writeln!(f, "{status:<10} {runtime:>8}  {key}")?;
        }
        Ok(())
    }
}
