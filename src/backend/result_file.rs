// src/backend/result_file.rs

//! Task-local JSON result files.
//!
//! A command may write `{"return_code": N}` to the path exported as
//! `FLOWSCHED_RESULT_FILE`. For local jobs a non-zero code overrides a clean
//! process exit.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::Action;

#[derive(Debug, Deserialize)]
struct ResultFile {
    return_code: Option<i64>,
}

/// `<root>/<block>/<version>/<task>/<action>.json`
pub fn result_path(root: &Path, block: &str, version: &str, task: &str, action: Action) -> PathBuf {
    root.join(block)
        .join(version)
        .join(task)
        .join(format!("{}.json", action.as_str()))
}

/// Read the `return_code` of a result file.
///
/// A missing file, unreadable JSON or a file without `return_code` all yield
/// `None`, which leaves the job's outcome to the process exit.
pub async fn read_return_code(path: &Path) -> Option<i64> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read result file");
            return None;
        }
    };

    match serde_json::from_str::<ResultFile>(&contents) {
        Ok(parsed) => {
            debug!(path = %path.display(), return_code = ?parsed.return_code, "result file read");
            parsed.return_code
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed result file ignored");
            None
        }
    }
}

/// Remove a stale result file before a new execution.
pub async fn clear(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "cannot remove stale result file");
        }
    }
}
