// src/workspace/board.rs

//! Authoritative per-task status with compare-and-swap updates.
//!
//! Every task owns a `watch` channel holding its [`TaskState`]. A second
//! channel carries a generation counter bumped on every change, so a task
//! waiting on its dependencies can sleep until *anything* moves.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;
use uuid::Uuid;

use crate::types::TaskStatus;

use super::model::TaskKey;

/// Live state of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Job of the action currently (or last) executing.
    pub job: Option<Uuid>,
    /// Wall time of the last execution.
    pub runtime: Option<Duration>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Undefined,
            job: None,
            runtime: None,
        }
    }
}

#[derive(Debug)]
pub struct StatusBoard {
    channels: HashMap<TaskKey, watch::Sender<TaskState>>,
    generation: watch::Sender<u64>,
}

impl StatusBoard {
    pub fn new(keys: impl IntoIterator<Item = TaskKey>) -> Self {
        let channels = keys
            .into_iter()
            .map(|key| (key, watch::channel(TaskState::default()).0))
            .collect();
        let (generation, _) = watch::channel(0);
        Self {
            channels,
            generation,
        }
    }

    pub fn state(&self, key: &TaskKey) -> Option<TaskState> {
        self.channels.get(key).map(|tx| tx.borrow().clone())
    }

    /// Status of a task; unknown keys read as `Undefined`.
    pub fn status(&self, key: &TaskKey) -> TaskStatus {
        self.channels
            .get(key)
            .map(|tx| tx.borrow().status)
            .unwrap_or(TaskStatus::Undefined)
    }

    /// Apply `f` to a task's state; observers are woken only if it returned
    /// `true`.
    pub fn update(&self, key: &TaskKey, f: impl FnOnce(&mut TaskState) -> bool) -> bool {
        let Some(tx) = self.channels.get(key) else {
            return false;
        };
        let changed = tx.send_if_modified(f);
        if changed {
            self.generation.send_modify(|g| *g = g.wrapping_add(1));
        }
        changed
    }

    /// Unconditionally set a task's status.
    pub fn set_status(&self, key: &TaskKey, status: TaskStatus) -> bool {
        let changed = self.update(key, |state| {
            if state.status == status {
                return false;
            }
            state.status = status;
            true
        });
        if changed {
            trace!(task = %key, %status, "task status set");
        }
        changed
    }

    /// Move `key` from `expected` to `new`; fails if another writer got there
    /// first.
    pub fn compare_and_set(&self, key: &TaskKey, expected: TaskStatus, new: TaskStatus) -> bool {
        let swapped = self.update(key, |state| {
            if state.status != expected {
                return false;
            }
            state.status = new;
            true
        });
        if swapped {
            trace!(task = %key, from = %expected, to = %new, "task status swapped");
        }
        swapped
    }

    pub fn set_job(&self, key: &TaskKey, job: Uuid) {
        self.update(key, |state| {
            state.job = Some(job);
            true
        });
    }

    pub fn set_runtime(&self, key: &TaskKey, runtime: Duration) {
        self.update(key, |state| {
            state.runtime = Some(runtime);
            true
        });
    }

    pub fn subscribe(&self, key: &TaskKey) -> Option<watch::Receiver<TaskState>> {
        self.channels.get(key).map(watch::Sender::subscribe)
    }

    /// Receiver that changes whenever any task's state changes.
    pub fn subscribe_all(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Wait until `key` reaches a terminal status.
    pub async fn wait_terminal(&self, key: &TaskKey) -> TaskStatus {
        let Some(mut rx) = self.subscribe(key) else {
            return TaskStatus::Undefined;
        };
        match rx.wait_for(|state| state.status.is_terminal()).await {
            Ok(state) => state.status,
            // The sender lives as long as the board, so this only happens on
            // teardown.
            Err(_) => self.status(key),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<TaskKey, TaskState> {
        self.channels
            .iter()
            .map(|(key, tx)| (key.clone(), tx.borrow().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> TaskKey {
        TaskKey::new("cpu", "v1", "syn", name)
    }

    #[test]
    fn unknown_tasks_read_as_undefined() {
        let board = StatusBoard::new([key("a")]);
        assert_eq!(board.status(&key("a")), TaskStatus::Undefined);
        assert_eq!(board.status(&key("zzz")), TaskStatus::Undefined);
        assert!(!board.set_status(&key("zzz"), TaskStatus::Pass));
    }

    #[test]
    fn compare_and_set_only_swaps_expected_status() {
        let board = StatusBoard::new([key("a")]);
        board.set_status(&key("a"), TaskStatus::Running);

        assert!(!board.compare_and_set(&key("a"), TaskStatus::Queued, TaskStatus::Cancelled));
        assert!(board.compare_and_set(&key("a"), TaskStatus::Running, TaskStatus::Killing));
        assert!(!board.compare_and_set(&key("a"), TaskStatus::Running, TaskStatus::Pass));
        assert_eq!(board.status(&key("a")), TaskStatus::Killing);
    }

    #[test]
    fn generation_moves_on_change_only() {
        let board = StatusBoard::new([key("a")]);
        let rx = board.subscribe_all();
        let before = *rx.borrow();
        board.set_status(&key("a"), TaskStatus::Queued);
        board.set_status(&key("a"), TaskStatus::Queued);
        assert_eq!(*rx.borrow(), before + 1);
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_final_status() {
        let board = std::sync::Arc::new(StatusBoard::new([key("a")]));
        board.set_status(&key("a"), TaskStatus::Running);

        let waiter = {
            let board = board.clone();
            tokio::spawn(async move { board.wait_terminal(&key("a")).await })
        };
        tokio::task::yield_now().await;
        board.set_status(&key("a"), TaskStatus::Fail);

        assert_eq!(waiter.await.unwrap(), TaskStatus::Fail);
    }
}
