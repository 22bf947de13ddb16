// src/backend/predict.rs

//! Optional memory-prediction hook for cluster submissions.
//!
//! The configured command receives the job's features as JSON on stdin and
//! prints a memory figure in MB. The figure replaces the `mem=` value of the
//! `rusage[...]` resource clause. Any failure keeps the original request.

use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::store::JobRecord;

const PREDICT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct JobFeatures<'a> {
    block: &'a str,
    version: &'a str,
    flow: &'a str,
    task: &'a str,
    action: &'a str,
    command: &'a str,
    cwd: String,
}

#[derive(Debug, Clone)]
pub struct MemoryPredictor {
    command: String,
    timeout: Duration,
}

impl MemoryPredictor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: PREDICT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Predicted memory in MB, or `None` when the hook fails in any way.
    pub async fn predict(&self, job: &JobRecord) -> Option<u64> {
        let features = JobFeatures {
            block: &job.block,
            version: &job.version,
            flow: &job.flow,
            task: &job.task,
            action: job.action.as_str(),
            command: &job.command,
            cwd: job.cwd.to_string_lossy().into_owned(),
        };
        let payload = match serde_json::to_vec(&features) {
            Ok(p) => p,
            Err(e) => {
                warn!(job = %job.uuid, error = %e, "cannot encode memory predictor input");
                return None;
            }
        };

        match tokio::time::timeout(self.timeout, self.run(&payload)).await {
            Ok(Ok(mb)) => {
                debug!(job = %job.uuid, mem_mb = mb, "memory predicted");
                Some(mb)
            }
            Ok(Err(reason)) => {
                warn!(job = %job.uuid, %reason, "memory predictor failed; keeping requested memory");
                None
            }
            Err(_) => {
                warn!(job = %job.uuid, "memory predictor timed out; keeping requested memory");
                None
            }
        }
    }

    async fn run(&self, payload: &[u8]) -> Result<u64, String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawn: {e}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload)
                .await
                .map_err(|e| format!("write stdin: {e}"))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("wait: {e}"))?;
        if !output.status.success() {
            return Err(format!("exited with {}", output.status));
        }
        parse_prediction(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_prediction(stdout: &str) -> Result<u64, String> {
    let text = stdout.trim();
    let value: f64 = text
        .parse()
        .map_err(|_| format!("unparsable prediction '{text}'"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("prediction out of range: {value}"));
    }
    Ok(value.ceil() as u64)
}

/// Put `mem_mb` into the `rusage[...]` clause of a resource string, adding
/// the clause if there is none.
pub fn rewrite_resources(resources: Option<&str>, mem_mb: u64) -> String {
    let Some(resources) = resources.filter(|r| !r.trim().is_empty()) else {
        return format!("rusage[mem={mem_mb}]");
    };

    let mem = Regex::new(r"mem=[0-9.]+[A-Za-z]*").ok();
    let rusage = Regex::new(r"rusage\[([^\]]*)\]").ok();
    match (mem, rusage) {
        (Some(mem), Some(rusage)) => match rusage.captures(resources) {
            Some(caps) => {
                let inner = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                let new_inner = if mem.is_match(inner) {
                    mem.replace(inner, format!("mem={mem_mb}").as_str()).into_owned()
                } else if inner.is_empty() {
                    format!("mem={mem_mb}")
                } else {
                    format!("{inner}:mem={mem_mb}")
                };
                rusage
                    .replace(resources, format!("rusage[{new_inner}]").as_str())
                    .into_owned()
            }
            None => format!("{resources} rusage[mem={mem_mb}]"),
        },
        _ => resources.to_string(),
    }
}
