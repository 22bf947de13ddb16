// src/scheduler/mod.rs

//! Run-order and group scheduling of tasks.
//!
//! - [`run_order`] walks a unit's bundles in order and applies fail-fast
//!   cancellation between them.
//! - [`group`] runs the (flow, vendor, branch) groups of a bundle, serially
//!   or in parallel.
//! - [`launch`] gates one task on its dependencies, persists its jobs and
//!   waits for them to finish.
//!
//! The scheduler never talks to a backend to start work: it only writes
//! `awaiting_dispatch` jobs and reads their status back from the store.

pub mod group;
pub mod launch;
pub mod run_order;
pub mod summary;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::backend::Backends;
use crate::config::model::ConfigSection;
use crate::errors::{FlowError, Result};
use crate::store::JobStore;
use crate::types::{Action, TaskStatus};
use crate::workspace::{TaskKey, TaskSpec, Workspace};

pub use summary::{RunSummary, is_failure_class};

/// Session-wide scheduling policy.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Actions executed per task, in order, stopping at the first failure.
    pub actions: Vec<Action>,
    pub fail_fast: bool,
    pub ignore_fail: bool,
    /// Walk the schedule without creating jobs; every launched task passes.
    pub dry_run: bool,
}

impl RunOptions {
    pub fn from_config(cfg: &ConfigSection) -> Self {
        Self {
            actions: vec![Action::Run],
            fail_fast: cfg.fail_fast,
            ignore_fail: cfg.ignore_fail,
            dry_run: false,
        }
    }
}

/// Which tasks of the workspace take part in a run. Empty lists match all.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub blocks: Vec<String>,
    pub versions: Vec<String>,
    pub flows: Vec<String>,
    pub tasks: Vec<String>,
}

impl Selection {
    pub fn matches(&self, key: &TaskKey) -> bool {
        fn hit(filter: &[String], value: &str) -> bool {
            filter.is_empty() || filter.iter().any(|f| f == value)
        }
        hit(&self.blocks, &key.block)
            && hit(&self.versions, &key.version)
            && hit(&self.flows, &key.flow)
            && hit(&self.tasks, &key.task)
    }
}

/// State shared by every scheduling future of one run.
pub(crate) struct RunContext {
    pub ws: Arc<Workspace>,
    pub store: JobStore,
    pub backends: Backends,
    pub options: RunOptions,
    pub selected: HashSet<TaskKey>,
    pub stopping: Arc<AtomicBool>,
}

impl RunContext {
    pub fn is_selected(&self, key: &TaskKey) -> bool {
        self.selected.contains(key)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn is_failure_class(&self, status: TaskStatus) -> bool {
        summary::is_failure_class(status, &self.ws.config.run_fail_markers)
    }

    /// Mark a task Cancelled unless it already started or finished.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let cancelled = self.ws.board.update(key, |state| {
            if state.status.is_terminal() || state.status.is_active() {
                return false;
            }
            state.status = TaskStatus::Cancelled;
            true
        });
        if cancelled {
            info!(task = %key, "task cancelled");
        }
        cancelled
    }
}

#[derive(Clone)]
pub struct Scheduler {
    ws: Arc<Workspace>,
    store: JobStore,
    backends: Backends,
    stopping: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(ws: Arc<Workspace>, store: JobStore, backends: Backends) -> Self {
        Self {
            ws,
            store,
            backends,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.ws
    }

    /// Tasks matched by `selection` that define at least one of `actions`.
    pub fn select(&self, selection: &Selection, actions: &[Action]) -> HashSet<TaskKey> {
        self.ws
            .tasks()
            .filter(|spec| selection.matches(&spec.key))
            .filter(|spec| actions.iter().any(|a| spec.has_action(*a)))
            .map(|spec| spec.key.clone())
            .collect()
    }

    /// Run every selected task to a terminal status.
    ///
    /// Units run concurrently; each walks its bundles in order.
    pub async fn run(&self, selection: &Selection, options: RunOptions) -> Result<RunSummary> {
        let selected = self.select(selection, &options.actions);
        if selected.is_empty() {
            warn!("no task matches the selection");
            return Ok(RunSummary::collect(&self.ws, &selected));
        }

        for key in &selected {
            let board = &self.ws.board;
            board.update(key, |state| {
                if state.status.is_active() || state.status == TaskStatus::Queued {
                    return false;
                }
                state.status = TaskStatus::Queued;
                state.runtime = None;
                true
            });
        }

        info!(
            tasks = selected.len(),
            actions = ?options.actions,
            fail_fast = options.fail_fast,
            dry_run = options.dry_run,
            "run started"
        );

        let ctx = Arc::new(RunContext {
            ws: Arc::clone(&self.ws),
            store: self.store.clone(),
            backends: self.backends.clone(),
            options,
            selected,
            stopping: Arc::clone(&self.stopping),
        });

        let mut units = JoinSet::new();
        for unit in &self.ws.units {
            if !unit.tasks.iter().any(|k| ctx.is_selected(k)) {
                continue;
            }
            units.spawn(run_order::run_unit(Arc::clone(&ctx), unit.clone()));
        }
        while let Some(joined) = units.join_next().await {
            joined.map_err(|e| FlowError::Other(anyhow::anyhow!("unit scheduler panicked: {e}")))?;
        }

        let summary = RunSummary::collect(&self.ws, &ctx.selected);
        info!(
            passed = summary.count(TaskStatus::Pass),
            failed = summary.failures(&ctx.ws.config.run_fail_markers).len(),
            "run finished"
        );
        Ok(summary)
    }

    /// Stop a task.
    ///
    /// A Queued task becomes Cancelled. A Running task becomes Killing; its
    /// launch loop signals the backend and sets Killed once the job ends.
    pub fn kill(&self, key: &TaskKey) -> Result<TaskStatus> {
        self.ws.require_task(key)?;
        let board = &self.ws.board;

        if board.compare_and_set(key, TaskStatus::Running, TaskStatus::Killing) {
            info!(task = %key, "kill requested");
            return Ok(TaskStatus::Killing);
        }
        if board.compare_and_set(key, TaskStatus::Queued, TaskStatus::Cancelled) {
            info!(task = %key, "queued task cancelled");
            return Ok(TaskStatus::Cancelled);
        }
        Ok(board.status(key))
    }

    /// Kill every active or queued task and keep anything new from starting.
    pub fn kill_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let keys: Vec<TaskKey> = self.ws.tasks().map(|spec| spec.key.clone()).collect();
        let mut stopped = 0usize;
        for key in &keys {
            if let Ok(TaskStatus::Killing | TaskStatus::Cancelled) = self.kill(key) {
                stopped += 1;
            }
        }
        warn!(stopped, "stopping all tasks");
    }

    /// Launch a single action of one task, ignoring its dependencies.
    pub async fn run_action(&self, key: &TaskKey, action: Action) -> Result<TaskStatus> {
        let spec: TaskSpec = self.ws.require_task(key)?.clone();
        if !spec.has_action(action) {
            return Err(FlowError::ConfigError(format!(
                "task {key} has no {action} action"
            )));
        }
        let ctx = RunContext {
            ws: Arc::clone(&self.ws),
            store: self.store.clone(),
            backends: self.backends.clone(),
            options: RunOptions {
                actions: vec![action],
                ..RunOptions::from_config(&self.ws.config)
            },
            selected: HashSet::from([key.clone()]),
            stopping: Arc::clone(&self.stopping),
        };
        Ok(launch::execute(&ctx, &spec).await)
    }
}
