// src/lib.rs

pub mod backend;
pub mod cli;
pub mod config;
pub mod depend;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backend::{Backends, ClusterBackend, LocalBackend};
use crate::cli::{CheckArgs, CliArgs, Command, JobsArgs, RunArgs};
use crate::config::loader::{default_config_path, load_and_validate};
use crate::config::model::ConfigFile;
use crate::engine::Engine;
use crate::scheduler::{RunOptions, Scheduler, Selection};
use crate::store::JobStore;
use crate::workspace::Workspace;

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("failed to load workspace {}", config_path.display()))?;

    match args.command {
        Command::Run(run) => run_tasks(&cfg, run).await,
        Command::Check(check) => {
            check_workspace(&cfg, &check)?;
            Ok(0)
        }
        Command::Jobs(jobs) => {
            list_jobs(&cfg, &jobs).await?;
            Ok(0)
        }
    }
}

/// Start the store, the dispatcher/watcher engine and the scheduler, then
/// run the selection to completion.
///
/// Ctrl-C kills every running task; the run still ends normally once the
/// killed jobs are reported back.
async fn run_tasks(cfg: &ConfigFile, args: RunArgs) -> Result<i32> {
    let ws = Arc::new(Workspace::from_config(cfg)?);

    let store = JobStore::open(&cfg.config.job_store)
        .await
        .with_context(|| format!("failed to open job store {}", cfg.config.job_store.display()))?;
    store.purge_stale().await?;

    let cluster = ClusterBackend::new(cfg.cluster.clone()).context("invalid [cluster] section")?;
    let backends = Backends::new(Arc::new(cluster), Arc::new(LocalBackend::new()));
    let engine = Engine::start(store.clone(), backends.clone(), &cfg.config);
    let scheduler = Scheduler::new(ws, store, backends);

    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            warn!("interrupted; killing running tasks");
            scheduler.kill_all();
        });
    }

    let selection = Selection {
        blocks: args.blocks,
        versions: args.versions,
        flows: args.flows,
        tasks: args.tasks,
    };
    let mut options = RunOptions::from_config(&cfg.config);
    if !args.actions.is_empty() {
        options.actions = args.actions;
    }
    if args.no_fail_fast {
        options.fail_fast = false;
    }
    if args.ignore_fail {
        options.ignore_fail = true;
    }
    options.dry_run = args.dry_run;

    let outcome = scheduler.run(&selection, options).await;
    engine.shutdown().await;
    let summary = outcome?;

    print!("{summary}");
    if summary.is_success(&cfg.config.run_fail_markers) {
        Ok(0)
    } else {
        info!(
            failed = summary.failures(&cfg.config.run_fail_markers).len(),
            "run ended with failures"
        );
        Ok(1)
    }
}

/// Print run order, dependency expressions and compiled graph of each unit.
fn check_workspace(cfg: &ConfigFile, args: &CheckArgs) -> Result<()> {
    let ws = Workspace::from_config(cfg)?;

    for unit in &ws.units {
        println!("{}/{}", unit.block, unit.version);
        let order: Vec<String> = unit.bundles.iter().map(|b| b.join("|")).collect();
        println!("  run_order: {}", order.join(" -> "));

        let Some(deps) = ws.dependencies.unit(&unit.block, &unit.version) else {
            continue;
        };
        for (task, expr) in &deps.expressions {
            if !expr.is_empty() {
                println!("  {task}: {expr}");
            }
        }
        for (from, to) in deps.graph.edges() {
            println!("    {from} -> {to}");
        }

        if let Some(task) = &args.task {
            if ws.task_by_name(&unit.block, &unit.version, task).is_none() {
                continue;
            }
            println!("  paths to {task}:");
            for path in ws.dependencies.paths_to(&unit.block, &unit.version, task) {
                println!("    {}", path.join(" -> "));
            }
        }
    }
    Ok(())
}

async fn list_jobs(cfg: &ConfigFile, args: &JobsArgs) -> Result<()> {
    let store = JobStore::open(&cfg.config.job_store)
        .await
        .with_context(|| format!("failed to open job store {}", cfg.config.job_store.display()))?;

    for job in store.list(args.status).await? {
        let exit = job
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<18} {:<8} {:<10} {:>4}  {}/{}/{}/{} {}",
            job.uuid,
            job.status,
            job.backend,
            job.job_id.as_deref().unwrap_or("-"),
            exit,
            job.block,
            job.version,
            job.flow,
            job.task,
            job.action,
        );
    }
    Ok(())
}
