// src/backend/cluster.rs

//! LSF-style batch scheduler backend (`bsub` / `bjobs` / `bkill`).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::model::ClusterSection;
use crate::errors::BackendError;
use crate::types::BackendKind;

use super::predict::{MemoryPredictor, rewrite_resources};
use super::{Backend, BackendState, Submission};

pub struct ClusterBackend {
    cfg: ClusterSection,
    job_id: Regex,
    predictor: Option<MemoryPredictor>,
}

impl ClusterBackend {
    pub fn new(cfg: ClusterSection) -> Result<Self, BackendError> {
        let job_id = Regex::new(&cfg.job_id_pattern)
            .map_err(|e| BackendError::MalformedJobId(format!("bad pattern: {e}")))?;
        let predictor = cfg.memory_predictor.clone().map(MemoryPredictor::new);
        Ok(Self {
            cfg,
            job_id,
            predictor,
        })
    }

    /// Command line for one submission, program first.
    async fn submission_args(&self, submission: &Submission) -> Vec<String> {
        let job = &submission.job;
        let mut args = split_command(&self.cfg.submit);

        args.extend([
            "-J".to_string(),
            format!("{}.{}.{}.{}", job.block, job.version, job.task, job.action.as_str()),
            "-cwd".to_string(),
            job.cwd.to_string_lossy().into_owned(),
            "-o".to_string(),
            submission.log_path.to_string_lossy().into_owned(),
        ]);

        if let Some(queue) = &self.cfg.queue {
            args.extend(["-q".to_string(), queue.clone()]);
        }

        let predicted = match &self.predictor {
            Some(predictor) => predictor.predict(job).await,
            None => None,
        };
        let resources = match predicted {
            Some(mb) => Some(rewrite_resources(self.cfg.resources.as_deref(), mb)),
            None => self.cfg.resources.clone(),
        };
        if let Some(resources) = resources {
            args.extend(["-R".to_string(), resources]);
        }

        args.extend(self.cfg.extra_args.iter().cloned());
        args.push(job.command.clone());
        args
    }

    fn extract_job_id(&self, line: &str) -> Option<String> {
        self.job_id
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    async fn submit(&self, submission: &Submission) -> Result<String, BackendError> {
        let args = self.submission_args(submission).await;
        let printable = args.join(" ");
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| BackendError::Spawn {
                command: printable.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty submit command"),
            })?;

        if let Some(parent) = submission.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| BackendError::Spawn {
                    command: printable.clone(),
                    source,
                })?;
        }

        let mut child = Command::new(program)
            .args(rest)
            .envs(submission.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BackendError::Spawn {
                command: printable.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().map(BufReader::new);
        let first_line = match stdout.as_mut() {
            Some(reader) => {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => None,
                    Ok(_) => Some(line),
                    Err(e) => {
                        warn!(job = %submission.job.uuid, error = %e, "cannot read submission output");
                        None
                    }
                }
            }
            None => None,
        };

        // Whatever the submitter prints after the id line goes to a side log
        // so the pipe never fills up.
        let side_log = submission.log_path.with_extension("submit.log");
        if let Some(reader) = stdout {
            tokio::spawn(drain_into(reader, side_log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_into(BufReader::new(stderr), side_log));
        }
        let uuid = submission.job.uuid;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(job = %uuid, %status, "submission command exited unsuccessfully")
                }
                Ok(_) => {}
                Err(e) => warn!(job = %uuid, error = %e, "cannot wait for submission command"),
            }
        });

        let line = first_line.ok_or(BackendError::EmptySubmission)?;
        let job_id = self
            .extract_job_id(&line)
            .ok_or_else(|| BackendError::MalformedJobId(line.trim().to_string()))?;

        info!(job = %submission.job.uuid, job_id = %job_id, "submitted to cluster");
        Ok(job_id)
    }

    async fn query(&self, job_ids: &[String]) -> Result<HashMap<String, BackendState>, BackendError> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut args = split_command(&self.cfg.status);
        let printable = args.join(" ");
        if args.is_empty() {
            return Err(BackendError::Query {
                command: printable,
                detail: "empty status command".to_string(),
            });
        }
        let program = args.remove(0);

        let output = Command::new(&program)
            .args(&args)
            .arg("-a")
            .arg("-w")
            .args(job_ids)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Query {
                command: printable.clone(),
                detail: e.to_string(),
            })?;

        // Non-zero exit is normal when some ids are no longer known; the
        // rows that were printed are still valid.
        let states = parse_status_output(&String::from_utf8_lossy(&output.stdout));
        debug!(queried = job_ids.len(), reported = states.len(), "cluster status polled");
        Ok(states)
    }

    async fn kill(&self, job_id: &str) -> Result<(), BackendError> {
        let mut args = split_command(&self.cfg.kill);
        if args.is_empty() {
            return Err(BackendError::Kill {
                job_id: job_id.to_string(),
                detail: "empty kill command".to_string(),
            });
        }
        let program = args.remove(0);

        let output = Command::new(&program)
            .args(&args)
            .arg(job_id)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Kill {
                job_id: job_id.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(BackendError::Kill {
                job_id: job_id.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(job_id, "cluster job kill requested");
        Ok(())
    }
}

fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_string).collect()
}

async fn drain_into<R>(reader: BufReader<R>, path: impl AsRef<Path>)
where
    R: AsyncRead + Unpin,
{
    let path = path.as_ref();
    let mut file = match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open submission log");
            return;
        }
    };
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if file.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Map a cluster STAT column onto a [`BackendState`].
pub fn parse_cluster_state(stat: &str) -> BackendState {
    match stat {
        "RUN" => BackendState::Running,
        "DONE" => BackendState::Done,
        "EXIT" => BackendState::Exit(None),
        "PEND" | "PSUSP" | "QUEUE" => BackendState::Pending,
        other => BackendState::Other(other.to_string()),
    }
}

/// Parse `bjobs -w` output: `JOBID USER STAT QUEUE ...` rows.
pub fn parse_status_output(stdout: &str) -> HashMap<String, BackendState> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?;
            if !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let stat = fields.nth(1)?;
            Some((id.to_string(), parse_cluster_state(stat)))
        })
        .collect()
}
