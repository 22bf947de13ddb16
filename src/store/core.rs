// src/store/core.rs

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::types::{Action, BackendKind, JobStatus};

/// One row of the `jobs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub uuid: Uuid,
    /// Backend-assigned id: cluster job number or local pid.
    pub job_id: Option<String>,
    pub backend: BackendKind,
    pub block: String,
    pub version: String,
    pub flow: String,
    pub task: String,
    pub action: Action,
    pub status: JobStatus,
    pub command: String,
    pub cwd: PathBuf,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub created_time: DateTime<Utc>,
    pub submitted_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
}

/// What the scheduler hands the store when a task action becomes ready.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub backend: BackendKind,
    pub block: String,
    pub version: String,
    pub flow: String,
    pub task: String,
    pub action: Action,
    pub command: String,
    pub cwd: PathBuf,
    pub log_path: Option<PathBuf>,
}

#[derive(sqlx::FromRow)]
pub(super) struct JobRow {
    pub uuid: Uuid,
    pub job_id: Option<String>,
    pub backend: String,
    pub block: String,
    pub version: String,
    pub flow: String,
    pub task: String,
    pub action: String,
    pub status: String,
    pub command: String,
    pub cwd: String,
    pub log_path: Option<String>,
    pub exit_code: Option<i64>,
    pub created_time: DateTime<Utc>,
    pub submitted_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status =
            JobStatus::parse(&row.status).ok_or_else(|| StoreError::UnknownStatus(row.status))?;
        let backend = BackendKind::from_str(&row.backend)
            .map_err(|_| StoreError::UnknownBackend(row.backend.clone()))?;
        let action = Action::from_str(&row.action)
            .map_err(|_| StoreError::UnknownStatus(format!("action {}", row.action)))?;

        Ok(JobRecord {
            uuid: row.uuid,
            job_id: row.job_id,
            backend,
            block: row.block,
            version: row.version,
            flow: row.flow,
            task: row.task,
            action,
            status,
            command: row.command,
            cwd: PathBuf::from(row.cwd),
            log_path: row.log_path.map(PathBuf::from),
            exit_code: row.exit_code.and_then(|c| i32::try_from(c).ok()),
            created_time: row.created_time,
            submitted_time: row.submitted_time,
            finished_time: row.finished_time,
        })
    }
}

pub(super) const JOB_COLUMNS: &str = "uuid, job_id, backend, block, version, flow, task, action, \
     status, command, cwd, log_path, exit_code, created_time, submitted_time, finished_time";

/// Durable job queue shared by the scheduler, dispatcher and watcher.
///
/// Cloning is cheap; all clones share one pool and one claim lock.
#[derive(Debug, Clone)]
pub struct JobStore {
    pub(super) pool: SqlitePool,
    /// Serializes the dispatcher's claim step across every holder of the store.
    pub(super) claim_lock: Arc<Mutex<()>>,
}

impl JobStore {
    /// Open (creating if needed) the SQLite file at `path` in WAL mode.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(path = %path.display(), "job store opened");
        Ok(store)
    }

    /// Private in-memory store on a single connection.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            claim_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                uuid           BLOB PRIMARY KEY NOT NULL,
                job_id         TEXT,
                backend        TEXT NOT NULL,
                block          TEXT NOT NULL,
                version        TEXT NOT NULL,
                flow           TEXT NOT NULL,
                task           TEXT NOT NULL,
                action         TEXT NOT NULL,
                status         TEXT NOT NULL,
                command        TEXT NOT NULL,
                cwd            TEXT NOT NULL,
                log_path       TEXT,
                exit_code      INTEGER,
                created_time   TEXT NOT NULL,
                submitted_time TEXT,
                finished_time  TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;

        debug!("job store schema ready");
        Ok(())
    }

    /// Drop every job a previous session left before it was running.
    ///
    /// Running rows and terminal history are kept.
    pub async fn purge_stale(&self) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM jobs WHERE status IN ({})",
            placeholders(JobStatus::PURGED_AT_STARTUP.len())
        );
        let mut query = sqlx::query(&sql);
        for status in JobStatus::PURGED_AT_STARTUP {
            query = query.bind(status.as_str());
        }
        let purged = query.execute(&self.pool).await?.rows_affected();
        if purged > 0 {
            info!(purged, "purged unfinished jobs from a previous session");
        }
        Ok(purged)
    }
}

pub(super) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
