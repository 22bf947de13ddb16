// src/store/jobs.rs

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::types::JobStatus;

use super::core::{JOB_COLUMNS, JobRecord, JobRow, JobStore, NewJob, placeholders};

impl JobStore {
    /// Persist a job in `awaiting_dispatch`.
    pub async fn insert(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let uuid = Uuid::new_v4();
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL, NULL)"
        );
        sqlx::query(&sql)
            .bind(uuid)
            .bind(job.backend.as_str())
            .bind(&job.block)
            .bind(&job.version)
            .bind(&job.flow)
            .bind(&job.task)
            .bind(job.action.as_str())
            .bind(JobStatus::AwaitingDispatch.as_str())
            .bind(&job.command)
            .bind(job.cwd.to_string_lossy().into_owned())
            .bind(job.log_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
            .bind(now)
            .execute(&self.pool)
            .await?;

        debug!(job = %uuid, task = %job.task, action = %job.action, "job queued for dispatch");

        Ok(JobRecord {
            uuid,
            job_id: None,
            backend: job.backend,
            block: job.block,
            version: job.version,
            flow: job.flow,
            task: job.task,
            action: job.action,
            status: JobStatus::AwaitingDispatch,
            command: job.command,
            cwd: job.cwd,
            log_path: job.log_path,
            exit_code: None,
            created_time: now,
            submitted_time: None,
            finished_time: None,
        })
    }

    /// Move up to `limit` awaiting jobs to `dispatching` and return them.
    ///
    /// Each row is moved by a conditional update inside one transaction, under
    /// the store-wide claim lock, so a job is claimed by exactly one caller.
    pub async fn claim_awaiting(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let _guard = self.claim_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<Uuid> = sqlx::query_scalar(
            "SELECT uuid FROM jobs WHERE status = ? ORDER BY created_time, rowid LIMIT ?",
        )
        .bind(JobStatus::AwaitingDispatch.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for uuid in candidates {
            let affected = sqlx::query("UPDATE jobs SET status = ? WHERE uuid = ? AND status = ?")
                .bind(JobStatus::Dispatching.as_str())
                .bind(uuid)
                .bind(JobStatus::AwaitingDispatch.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if affected == 1 {
                claimed.push(uuid);
            }
        }

        let mut jobs = Vec::with_capacity(claimed.len());
        for uuid in &claimed {
            let row: JobRow = sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE uuid = ?"
            ))
            .bind(uuid)
            .fetch_one(&mut *tx)
            .await?;
            jobs.push(JobRecord::try_from(row)?);
        }

        tx.commit().await?;
        Ok(jobs)
    }

    /// Record the outcome of a submission attempt.
    ///
    /// The job becomes `dispatched` whether or not the backend returned an id.
    pub async fn mark_dispatched(
        &self,
        uuid: Uuid,
        job_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, job_id = ?, submitted_time = ?
            WHERE uuid = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Dispatched.as_str())
        .bind(job_id)
        .bind(Utc::now())
        .bind(uuid)
        .bind(JobStatus::Dispatching.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            warn!(job = %uuid, "job left dispatching before its submission was recorded");
        }
        Ok(affected == 1)
    }

    /// Jobs the watcher reconciles against their backends.
    pub async fn watched_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.jobs_with_status(&JobStatus::WATCHED).await
    }

    pub async fn jobs_with_status(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({}) ORDER BY created_time, rowid",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    /// Set a job's status (and exit code) if it differs from the stored one.
    ///
    /// Terminal rows are never rewritten. Returns whether a row changed.
    pub async fn update_status(
        &self,
        uuid: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<bool, StoreError> {
        let finished: Option<DateTime<Utc>> = status.is_terminal().then(Utc::now);
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                exit_code = COALESCE(?, exit_code),
                finished_time = COALESCE(?, finished_time)
            WHERE uuid = ? AND status <> ? AND status NOT IN (?, ?)
            "#,
        )
        .bind(status.as_str())
        .bind(exit_code)
        .bind(finished)
        .bind(uuid)
        .bind(status.as_str())
        .bind(JobStatus::Passed.as_str())
        .bind(JobStatus::Failed.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    /// Fail a job that has not been claimed yet. Returns false if the
    /// dispatcher already took it.
    pub async fn cancel_awaiting(&self, uuid: Uuid) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            "UPDATE jobs SET status = ?, finished_time = ? WHERE uuid = ? AND status = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(Utc::now())
        .bind(uuid)
        .bind(JobStatus::AwaitingDispatch.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE uuid = ?"))
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobRecord::try_from).transpose()
    }

    pub async fn require(&self, uuid: Uuid) -> Result<JobRecord, StoreError> {
        self.get(uuid).await?.ok_or(StoreError::JobNotFound(uuid))
    }

    /// All jobs, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError> {
        match status {
            Some(status) => self.jobs_with_status(&[status]).await,
            None => {
                let rows: Vec<JobRow> = sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_time, rowid"
                ))
                .fetch_all(&self.pool)
                .await?;
                rows.into_iter().map(JobRecord::try_from).collect()
            }
        }
    }
}
