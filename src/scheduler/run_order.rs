// src/scheduler/run_order.rs

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::workspace::{TaskKey, Unit};

use super::RunContext;
use super::group::run_group;

/// Walk a unit's bundles strictly in order.
///
/// With fail-fast, a bundle following one that ended with a failure-class
/// task is cancelled without running. Cancellation is itself failure-class,
/// so it carries on to every later bundle.
pub(crate) async fn run_unit(ctx: Arc<RunContext>, unit: Unit) {
    info!(block = %unit.block, version = %unit.version, bundles = unit.bundles.len(), "unit started");
    let mut previous_failed = false;

    for (index, bundle) in unit.bundles.iter().enumerate() {
        let keys: Vec<TaskKey> = unit
            .tasks_in_bundle(index)
            .filter(|k| ctx.is_selected(k))
            .cloned()
            .collect();

        let skip = index > 0 && previous_failed && ctx.options.fail_fast;
        if skip || ctx.is_stopping() {
            info!(
                block = %unit.block,
                version = %unit.version,
                bundle = %bundle.join("|"),
                "cancelling bundle after upstream failure"
            );
            for key in &keys {
                ctx.cancel(key);
            }
        } else if !keys.is_empty() {
            debug!(block = %unit.block, version = %unit.version, bundle = %bundle.join("|"), "bundle started");
            run_bundle(&ctx, &unit, bundle).await;
        }

        let failed = keys
            .iter()
            .any(|k| ctx.is_failure_class(ctx.ws.board.status(k)));
        // A bundle with nothing selected passes the previous verdict on.
        previous_failed = if keys.is_empty() { previous_failed } else { failed };
    }

    info!(block = %unit.block, version = %unit.version, "unit finished");
}

/// Launch every group of every flow of a bundle and join them all.
async fn run_bundle(ctx: &Arc<RunContext>, unit: &Unit, bundle: &[String]) {
    let mut groups = JoinSet::new();
    for flow in bundle {
        for group in ctx.ws.groups_in_flow(unit, flow) {
            if !group.members.iter().any(|k| ctx.is_selected(k)) {
                continue;
            }
            groups.spawn(run_group(Arc::clone(ctx), group));
        }
    }
    while let Some(joined) = groups.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "group scheduler panicked");
        }
    }
}
