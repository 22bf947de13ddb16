// src/engine/watcher.rs

//! Reconciles dispatched jobs with what their backends report.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::result_file::{read_return_code, result_path};
use crate::backend::{BackendState, Backends, map_backend_state};
use crate::config::model::ConfigSection;
use crate::errors::StoreError;
use crate::store::{JobRecord, JobStore};
use crate::types::{BackendKind, JobStatus};

pub struct Watcher {
    store: JobStore,
    backends: Backends,
    result_root: PathBuf,
    interval: Duration,
    orphan_grace: Duration,
}

impl Watcher {
    pub fn new(store: JobStore, backends: Backends, cfg: &ConfigSection) -> Self {
        Self {
            store,
            backends,
            result_root: cfg.result_root.clone(),
            interval: cfg.watch_interval(),
            orphan_grace: cfg.orphan_grace(),
        }
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "watcher started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.watch_cycle().await {
                error!(error = %e, "watch cycle failed");
            }
        }

        info!("watcher stopped");
    }

    /// One reconciliation pass. Returns the number of rows changed.
    pub async fn watch_cycle(&self) -> Result<usize, StoreError> {
        let jobs = self.store.watched_jobs().await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut by_backend: HashMap<BackendKind, Vec<&JobRecord>> = HashMap::new();
        let mut changed = 0;

        for job in &jobs {
            match &job.job_id {
                Some(_) => by_backend.entry(job.backend).or_default().push(job),
                None => {
                    if self.resolve_orphan(job).await? {
                        changed += 1;
                    }
                }
            }
        }

        for (kind, batch) in by_backend {
            let ids: Vec<String> = batch.iter().filter_map(|j| j.job_id.clone()).collect();
            let states = match self.backends.get(kind).query(&ids).await {
                Ok(states) => states,
                Err(e) => {
                    warn!(backend = %kind, jobs = ids.len(), error = %e, "status query failed; retrying next cycle");
                    continue;
                }
            };

            for job in batch {
                let Some(state) = job.job_id.as_ref().and_then(|id| states.get(id)) else {
                    continue;
                };
                if self.apply(job, state).await? {
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            debug!(changed, "job statuses updated");
        }
        Ok(changed)
    }

    /// A job with no backend id is left alone while the dispatcher may still
    /// be writing it; past the grace period a dispatched one has failed.
    async fn resolve_orphan(&self, job: &JobRecord) -> Result<bool, StoreError> {
        if job.status != JobStatus::Dispatched {
            return Ok(false);
        }
        let since = job.submitted_time.unwrap_or(job.created_time);
        let age = (Utc::now() - since).to_std().unwrap_or_default();
        if age < self.orphan_grace {
            return Ok(false);
        }
        warn!(job = %job.uuid, task = %job.task, "dispatched job has no backend id; marking failed");
        self.store.update_status(job.uuid, JobStatus::Failed, None).await
    }

    async fn apply(&self, job: &JobRecord, state: &BackendState) -> Result<bool, StoreError> {
        let Some((mut status, mut exit_code)) = map_backend_state(state) else {
            return Ok(false);
        };

        if status == JobStatus::Passed && job.backend == BackendKind::Local {
            let path = result_path(&self.result_root, &job.block, &job.version, &job.task, job.action);
            if let Some(code) = read_return_code(&path).await {
                if code != 0 {
                    debug!(job = %job.uuid, return_code = code, "result file reports failure");
                    status = JobStatus::Failed;
                    exit_code = i32::try_from(code).ok().or(Some(1));
                }
            }
        }

        if status == job.status {
            return Ok(false);
        }

        let updated = self.store.update_status(job.uuid, status, exit_code).await?;
        if updated {
            info!(job = %job.uuid, task = %job.task, from = %job.status, to = %status, "job status changed");
        }
        Ok(updated)
    }
}
