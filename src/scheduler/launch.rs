// src/scheduler/launch.rs

//! Launching one task: dependency gate, job creation and the poll loop that
//! waits for the job store to report a terminal status.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::default_log_path;
use crate::backend::result_file;
use crate::depend::{DepExpr, DepState, Readiness, clean, parse};
use crate::errors::Result;
use crate::store::{JobRecord, NewJob};
use crate::types::{JobStatus, RunType, TaskStatus};
use crate::workspace::{ResolvedAction, TaskKey, TaskSpec};

use super::RunContext;

enum Gate {
    Ready,
    Blocked,
    /// The task left Queued while waiting (killed or cancelled).
    Interrupted,
}

/// Bring a task from Queued to a terminal status.
pub(crate) async fn launch_task(ctx: &RunContext, key: &TaskKey) -> TaskStatus {
    let board = &ctx.ws.board;
    let status = board.status(key);
    if status.is_active() {
        debug!(task = %key, "task already running; waiting for it");
        return board.wait_terminal(key).await;
    }
    if status.is_terminal() {
        return status;
    }
    let Some(spec) = ctx.ws.task(key).cloned() else {
        return TaskStatus::Undefined;
    };

    match wait_for_dependencies(ctx, &spec).await {
        Gate::Ready => {}
        Gate::Blocked => {
            info!(task = %key, "dependencies can no longer be met");
            ctx.cancel(key);
            return board.status(key);
        }
        Gate::Interrupted => return board.status(key),
    }

    if ctx.is_stopping() {
        ctx.cancel(key);
        return board.status(key);
    }
    if !board.compare_and_set(key, TaskStatus::Queued, TaskStatus::Running) {
        return board.status(key);
    }
    run_actions(ctx, &spec).await
}

/// Run a task's actions regardless of its dependencies, claiming it first
/// unless it is already running.
pub(crate) async fn execute(ctx: &RunContext, spec: &TaskSpec) -> TaskStatus {
    let board = &ctx.ws.board;
    let claimed = board.update(&spec.key, |state| {
        if state.status.is_active() {
            return false;
        }
        state.status = TaskStatus::Running;
        true
    });
    if !claimed {
        return board.wait_terminal(&spec.key).await;
    }
    run_actions(ctx, spec).await
}

async fn run_actions(ctx: &RunContext, spec: &TaskSpec) -> TaskStatus {
    let key = &spec.key;
    let board = &ctx.ws.board;
    let started = Instant::now();
    let mut outcome = TaskStatus::Pass;

    for action in &ctx.options.actions {
        let Some(resolved) = spec.resolve_action(*action) else {
            continue;
        };
        if board.status(key) == TaskStatus::Killing {
            break;
        }
        match run_job(ctx, spec, &resolved).await {
            Ok(JobStatus::Passed) => {}
            Ok(status) => {
                debug!(task = %key, action = %action, job_status = %status, "action failed");
                outcome = TaskStatus::Fail;
                break;
            }
            Err(e) => {
                error!(task = %key, action = %action, error = %e, "action could not be run");
                outcome = TaskStatus::Fail;
                break;
            }
        }
    }

    board.set_runtime(key, started.elapsed());
    board.update(key, |state| {
        if !state.status.is_active() {
            return false;
        }
        state.status = if state.status == TaskStatus::Killing {
            TaskStatus::Killed
        } else {
            outcome
        };
        true
    });

    let status = board.status(key);
    info!(task = %key, %status, elapsed_ms = started.elapsed().as_millis() as u64, "task finished");
    status
}

/// Persist one action as a job and wait for it to reach a terminal status.
async fn run_job(ctx: &RunContext, spec: &TaskSpec, action: &ResolvedAction) -> Result<JobStatus> {
    let key = &spec.key;
    if ctx.options.dry_run {
        info!(task = %key, action = %action.action, backend = %action.backend, command = %action.command, "dry run");
        return Ok(JobStatus::Passed);
    }

    result_file::clear(&ctx.ws.result_file(key, action.action)).await;

    let job = ctx
        .store
        .insert(NewJob {
            backend: action.backend,
            block: key.block.clone(),
            version: key.version.clone(),
            flow: key.flow.clone(),
            task: key.task.clone(),
            action: action.action,
            command: action.command.clone(),
            cwd: action.cwd.clone(),
            log_path: Some(default_log_path(
                &ctx.ws.config.log_dir,
                &key.block,
                &key.version,
                &key.task,
                action.action,
            )),
        })
        .await?;
    ctx.ws.board.set_job(key, job.uuid);
    info!(task = %key, action = %action.action, job = %job.uuid, backend = %action.backend, "job created");

    let poll = ctx.ws.config.task_poll_interval();
    let mut signalled = false;
    loop {
        tokio::time::sleep(poll).await;
        let current = ctx.store.require(job.uuid).await?;
        if current.status.is_terminal() {
            return Ok(current.status);
        }
        if !signalled && ctx.ws.board.status(key) == TaskStatus::Killing {
            signalled = signal_kill(ctx, &current).await;
        }
    }
}

/// Stop a job on behalf of a Killing task. Returns false when the job is in
/// a state that cannot be signalled yet, so the next poll retries.
async fn signal_kill(ctx: &RunContext, job: &JobRecord) -> bool {
    match (job.status, &job.job_id) {
        (JobStatus::AwaitingDispatch, _) => match ctx.store.cancel_awaiting(job.uuid).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(job = %job.uuid, error = %e, "cannot cancel undispatched job");
                false
            }
        },
        (_, Some(job_id)) => {
            if let Err(e) = ctx.backends.get(job.backend).kill(job_id).await {
                warn!(job = %job.uuid, job_id = %job_id, error = %e, "kill failed");
            }
            true
        }
        (_, None) => false,
    }
}

/// Task names a dependency of `spec` may refer to in this run.
///
/// Tasks outside the selection, in a later bundle, or later in the same
/// serial group can never finish before `spec` starts, so they are dropped.
fn dependency_scope(ctx: &RunContext, spec: &TaskSpec) -> Vec<String> {
    let key = &spec.key;
    let Some(unit) = ctx.ws.unit(&key.block, &key.version) else {
        return Vec::new();
    };
    let own_bundle = unit.bundle_of(&key.flow).unwrap_or(usize::MAX);

    let serial_members: Vec<TaskKey> = if spec.run_type == RunType::Serial {
        let group_key = spec.group_key();
        ctx.ws
            .groups_in_flow(unit, &key.flow)
            .into_iter()
            .find(|g| g.key == group_key)
            .map(|g| g.members)
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    let own_position = serial_members.iter().position(|k| k == key);

    unit.tasks
        .iter()
        .filter(|k| ctx.is_selected(k))
        .filter(|k| unit.bundle_of(&k.flow).is_some_and(|b| b <= own_bundle))
        .filter(|k| {
            match (own_position, serial_members.iter().position(|m| m == *k)) {
                (Some(own), Some(theirs)) => theirs < own,
                _ => true,
            }
        })
        .map(|k| k.task.clone())
        .collect()
}

fn dependency_expression(ctx: &RunContext, spec: &TaskSpec) -> DepExpr {
    let key = &spec.key;
    let raw = ctx
        .ws
        .dependencies
        .expression(&key.block, &key.version, &key.task)
        .unwrap_or_default();
    let scope = dependency_scope(ctx, spec);

    match clean(&scope, &key.task, &raw).and_then(|cleaned| parse(&cleaned)) {
        Ok(expr) => expr,
        Err(e) => {
            warn!(task = %key, error = %e, "ignoring unusable dependency expression");
            DepExpr::Repeat(Vec::new())
        }
    }
}

fn dependency_state(ctx: &RunContext, key: &TaskKey, name: &str) -> DepState {
    let Some(dep) = ctx.ws.task_by_name(&key.block, &key.version, name) else {
        return DepState::Done;
    };
    match ctx.ws.board.status(&dep.key) {
        TaskStatus::Pass => DepState::Done,
        TaskStatus::Fail | TaskStatus::Killed | TaskStatus::Cancelled => {
            if ctx.options.ignore_fail {
                DepState::Done
            } else {
                DepState::Blocked
            }
        }
        TaskStatus::Queued | TaskStatus::Running | TaskStatus::Killing | TaskStatus::Undefined => {
            DepState::Pending
        }
    }
}

/// Wait until the task's dependency expression resolves.
///
/// Any board change re-evaluates it; the poll interval bounds the wait in
/// case a change is missed.
async fn wait_for_dependencies(ctx: &RunContext, spec: &TaskSpec) -> Gate {
    let key = &spec.key;
    let expr = dependency_expression(ctx, spec);
    if expr.is_empty() {
        return Gate::Ready;
    }
    debug!(task = %key, expr = %expr, "waiting for dependencies");

    let mut changes = ctx.ws.board.subscribe_all();
    let poll = ctx.ws.config.task_poll_interval();
    loop {
        if ctx.ws.board.status(key) != TaskStatus::Queued {
            return Gate::Interrupted;
        }
        match expr.evaluate(&|name| dependency_state(ctx, key, name)) {
            Readiness::Satisfied => return Gate::Ready,
            Readiness::Unsatisfiable => return Gate::Blocked,
            Readiness::Waiting => {}
        }
        let _ = tokio::time::timeout(poll, changes.changed()).await;
    }
}
