// src/scheduler/group.rs

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::types::{RunType, TaskStatus};
use crate::workspace::TaskGroup;

use super::RunContext;
use super::launch::launch_task;

/// Run one (block, version, flow, vendor, branch) group per its run-type.
pub(crate) async fn run_group(ctx: Arc<RunContext>, group: TaskGroup) {
    debug!(group = %group.key, run_type = ?group.run_type, members = group.members.len(), "group started");
    match group.run_type {
        RunType::Serial => run_serial(&ctx, &group).await,
        RunType::Parallel => run_parallel(&ctx, &group).await,
    }
    debug!(group = %group.key, "group finished");
}

/// Fail-stop chain in declaration order.
async fn run_serial(ctx: &Arc<RunContext>, group: &TaskGroup) {
    let members: Vec<_> = group
        .members
        .iter()
        .filter(|k| ctx.is_selected(k))
        .collect();

    for (i, key) in members.iter().enumerate() {
        let status = launch_task(ctx, key).await;
        if status == TaskStatus::Pass || ctx.options.ignore_fail {
            continue;
        }
        debug!(task = %key, %status, "serial group stopped");
        for rest in &members[i + 1..] {
            ctx.cancel(rest);
        }
        break;
    }
}

/// Independent members, joined at the end.
async fn run_parallel(ctx: &Arc<RunContext>, group: &TaskGroup) {
    let mut members = JoinSet::new();
    for key in group.members.iter().filter(|k| ctx.is_selected(k)) {
        let ctx = Arc::clone(ctx);
        let key = key.clone();
        members.spawn(async move { launch_task(&ctx, &key).await });
    }
    while let Some(joined) = members.join_next().await {
        if let Err(e) = joined {
            error!(group = %group.key, error = %e, "parallel member panicked");
        }
    }
}
