// src/engine/dispatcher.rs

//! Moves jobs from `awaiting_dispatch` to their backends.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Backends, Submission, job_environment, job_log_path};
use crate::config::model::ConfigSection;
use crate::errors::StoreError;
use crate::store::{JobRecord, JobStore};

/// Attempts at recording a submission before the job is given up on.
const RECORD_ATTEMPTS: u32 = 5;

/// Claims awaiting jobs on a fixed interval and submits them through a
/// semaphore-bounded worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    store: JobStore,
    backends: Backends,
    workers: Arc<Semaphore>,
    log_dir: PathBuf,
    result_root: PathBuf,
    interval: Duration,
    batch: usize,
}

impl Dispatcher {
    pub fn new(store: JobStore, backends: Backends, cfg: &ConfigSection) -> Self {
        Self {
            store,
            backends,
            workers: Arc::new(Semaphore::new(cfg.submit_workers)),
            log_dir: cfg.log_dir.clone(),
            result_root: cfg.result_root.clone(),
            interval: cfg.dispatch_interval(),
            batch: cfg.submit_workers.saturating_mul(4).max(1),
        }
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "dispatcher started");

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

            if let Err(e) = self.dispatch_cycle().await {
                error!(error = %e, "dispatch cycle failed");
            }
        }

        info!("dispatcher stopped");
    }

    /// Claim every awaiting job and hand it to the worker pool.
    ///
    /// Returns the handles of the spawned submissions.
    pub async fn dispatch_cycle(&self) -> Result<Vec<JoinHandle<()>>, StoreError> {
        let claimed = self.store.claim_awaiting(self.batch).await?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }
        debug!(claimed = claimed.len(), "jobs claimed for dispatch");

        let handles = claimed
            .into_iter()
            .map(|job| {
                let this = self.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = this.workers.clone().acquire_owned().await else {
                        return;
                    };
                    this.submit(job).await;
                })
            })
            .collect();
        Ok(handles)
    }

    async fn submit(&self, job: JobRecord) {
        let submission = Submission {
            env: job_environment(&job, &self.result_root),
            log_path: job_log_path(&self.log_dir, &job),
            job,
        };
        let uuid = submission.job.uuid;
        let backend = self.backends.get(submission.job.backend);

        let job_id = match backend.submit(&submission).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    job = %uuid,
                    task = %submission.job.task,
                    backend = %submission.job.backend,
                    error = %e,
                    "submission failed"
                );
                None
            }
        };

        // Until this lands the job sits in `dispatching`, where the watcher
        // never looks at it.
        let store = &self.store;
        let id = job_id.as_deref();
        let recorded = retry_store_write(RECORD_ATTEMPTS, self.interval, move || {
            store.mark_dispatched(uuid, id)
        })
        .await;
        if let Err(e) = recorded {
            error!(job = %uuid, job_id = ?job_id, error = %e, "cannot record dispatch");
        }
    }
}

/// Run a store write until it succeeds or `attempts` tries have failed.
pub(crate) async fn retry_store_write<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut write: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "job store write failed; retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
