// src/backend/local.rs

//! Local subprocess backend: `sh -c <command>`, the OS pid is the job id.
//!
//! A reaper task per child records its exit code. Status queries scan the
//! process table once for all pids of a cycle.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::BackendError;
use crate::types::BackendKind;

use super::{Backend, BackendState, Submission};

/// What the process table says about a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Alive,
    Zombie,
    Absent,
}

/// How long a reaped child's exit code is kept for the watcher.
const EXIT_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct Child {
    /// Distinguishes this spawn from an earlier child that had the same pid.
    token: u64,
    exit: Option<(i32, Instant)>,
}

/// Children spawned by this process, keyed by pid.
#[derive(Debug, Default)]
struct Registry {
    children: HashMap<u32, Child>,
    next_token: u64,
}

impl Registry {
    /// Track a new child. Whatever an earlier child with the same pid left
    /// behind is replaced.
    fn register(&mut self, pid: u32) -> u64 {
        self.prune(Instant::now());
        self.next_token += 1;
        self.children.insert(
            pid,
            Child {
                token: self.next_token,
                exit: None,
            },
        );
        self.next_token
    }

    /// Store a reaped exit code unless the pid now belongs to a newer child.
    fn record_exit(&mut self, pid: u32, token: u64, code: i32) -> bool {
        match self.children.get_mut(&pid) {
            Some(child) if child.token == token => {
                child.exit = Some((code, Instant::now()));
                true
            }
            _ => false,
        }
    }

    fn exit_code(&self, pid: u32) -> Option<i32> {
        self.children
            .get(&pid)
            .and_then(|child| child.exit)
            .map(|(code, _)| code)
    }

    fn is_ours(&self, pid: u32) -> bool {
        self.children.contains_key(&pid)
    }

    fn prune(&mut self, now: Instant) {
        self.children.retain(|_, child| match child.exit {
            Some((_, reaped)) => now.saturating_duration_since(reaped) < EXIT_RETENTION,
            None => true,
        });
    }
}

pub struct LocalBackend {
    registry: Arc<Mutex<Registry>>,
    system: Mutex<System>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            system: Mutex::new(System::new()),
        }
    }

    fn scan(&self, pids: &[Pid]) -> HashMap<Pid, Presence> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(pids), true);
        pids.iter()
            .map(|pid| {
                let presence = match system.process(*pid) {
                    Some(p) if p.status() == ProcessStatus::Zombie => Presence::Zombie,
                    Some(_) => Presence::Alive,
                    None => Presence::Absent,
                };
                (*pid, presence)
            })
            .collect()
    }
}

/// Decide a local job's state.
///
/// A recorded exit code always wins. For our own children an exited process
/// is left alone until its reaper has recorded the code; processes inherited
/// from an earlier session count as passed once gone.
pub fn classify(recorded: Option<i32>, ours: bool, presence: Presence) -> BackendState {
    match (recorded, presence) {
        (Some(0), _) => BackendState::Done,
        (Some(code), _) => BackendState::Exit(Some(code)),
        (None, Presence::Alive) => BackendState::Running,
        (None, Presence::Zombie | Presence::Absent) if ours => {
            BackendState::Other("exiting".to_string())
        }
        (None, Presence::Zombie | Presence::Absent) => BackendState::Done,
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(&self, submission: &Submission) -> Result<String, BackendError> {
        let job = &submission.job;
        let spawn_err = |source: std::io::Error| BackendError::Spawn {
            command: job.command.clone(),
            source,
        };

        if let Some(parent) = submission.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(spawn_err)?;
        }
        let stdout = File::create(&submission.log_path).map_err(spawn_err)?;
        let stderr = stdout.try_clone().map_err(spawn_err)?;

        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&job.command)
            .current_dir(&job.cwd)
            .envs(submission.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);
        let mut child = Command::from(cmd).spawn().map_err(spawn_err)?;

        let pid = child.id().ok_or_else(|| {
            spawn_err(std::io::Error::other("child exited before its pid was read"))
        })?;

        let token = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(pid);

        let registry = Arc::clone(&self.registry);
        let uuid = job.uuid;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(job = %uuid, pid, error = %e, "failed to wait on local job");
                    -1
                }
            };
            let recorded = registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_exit(pid, token, code);
            if recorded {
                debug!(job = %uuid, pid, code, "local job reaped");
            } else {
                debug!(job = %uuid, pid, code, "pid already reused; exit dropped");
            }
        });

        info!(job = %uuid, pid, "local job started");
        Ok(pid.to_string())
    }

    async fn query(&self, job_ids: &[String]) -> Result<HashMap<String, BackendState>, BackendError> {
        let pids: Vec<(String, u32)> = job_ids
            .iter()
            .filter_map(|id| id.parse::<u32>().ok().map(|pid| (id.clone(), pid)))
            .collect();
        let sys_pids: Vec<Pid> = pids.iter().map(|(_, p)| Pid::from_u32(*p)).collect();
        let presence = self.scan(&sys_pids);

        // Read the registry after the scan so an exit reaped in between is
        // still seen.
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let states = pids
            .into_iter()
            .map(|(id, pid)| {
                let seen = presence
                    .get(&Pid::from_u32(pid))
                    .copied()
                    .unwrap_or(Presence::Absent);
                let state = classify(registry.exit_code(pid), registry.is_ours(pid), seen);
                (id, state)
            })
            .collect();
        Ok(states)
    }

    async fn kill(&self, job_id: &str) -> Result<(), BackendError> {
        let pid: u32 = job_id.parse().map_err(|_| BackendError::Kill {
            job_id: job_id.to_string(),
            detail: "not a pid".to_string(),
        })?;

        // The job runs in its own process group; signal the whole group.
        let output = Command::new("kill")
            .arg("-TERM")
            .arg("--")
            .arg(format!("-{pid}"))
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
        info!(pid, "local job signalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sample_submission;

    #[test]
    fn recorded_exit_wins() {
        assert_eq!(classify(Some(0), true, Presence::Alive), BackendState::Done);
        assert_eq!(
            classify(Some(2), true, Presence::Absent),
            BackendState::Exit(Some(2))
        );
    }

    #[test]
    fn foreign_processes_pass_once_gone() {
        assert_eq!(classify(None, false, Presence::Absent), BackendState::Done);
        assert_eq!(classify(None, false, Presence::Zombie), BackendState::Done);
        assert_eq!(classify(None, false, Presence::Alive), BackendState::Running);
    }

    #[test]
    fn own_children_wait_for_reaper() {
        assert!(matches!(
            classify(None, true, Presence::Absent),
            BackendState::Other(_)
        ));
    }

    #[test]
    fn reused_pid_starts_without_an_exit() {
        let mut registry = Registry::default();
        let first = registry.register(4242);
        assert!(registry.record_exit(4242, first, 3));
        assert_eq!(registry.exit_code(4242), Some(3));

        let second = registry.register(4242);
        assert_eq!(registry.exit_code(4242), None);
        assert!(registry.is_ours(4242));

        // A late reaper of the first child must not touch the new one.
        assert!(!registry.record_exit(4242, first, 3));
        assert_eq!(registry.exit_code(4242), None);
        assert!(registry.record_exit(4242, second, 0));
        assert_eq!(registry.exit_code(4242), Some(0));
    }

    #[test]
    fn old_exits_are_pruned() {
        let mut registry = Registry::default();
        let done = registry.register(1);
        registry.register(2);
        registry.record_exit(1, done, 0);

        registry.prune(Instant::now() + EXIT_RETENTION + Duration::from_secs(1));
        assert!(!registry.is_ours(1));
        assert!(registry.is_ours(2));
    }

    #[tokio::test]
    async fn runs_a_command_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();

        let pid = backend
            .submit(&sample_submission(dir.path(), "t", "echo hi; exit 3"))
            .await
            .unwrap();
        let mut state = BackendState::Running;
        for _ in 0..100 {
            state = backend.query(&[pid.clone()]).await.unwrap()[&pid].clone();
            if matches!(state, BackendState::Exit(_) | BackendState::Done) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(state, BackendState::Exit(Some(3)));
        let log = std::fs::read_to_string(dir.path().join("t.run.log")).unwrap();
        assert_eq!(log.trim(), "hi");
    }

    #[tokio::test]
    async fn stale_exit_does_not_finish_a_live_job() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();

        let id = backend
            .submit(&sample_submission(dir.path(), "slow", "sleep 5"))
            .await
            .unwrap();
        let pid: u32 = id.parse().unwrap();

        // What the reaper of an earlier child with this pid would write.
        let stale = {
            let mut registry = backend.registry.lock().unwrap();
            let current = registry.children[&pid].token;
            registry.record_exit(pid, current - 1, 3)
        };
        assert!(!stale);
        assert_eq!(
            backend.query(&[id.clone()]).await.unwrap()[&id],
            BackendState::Running
        );

        backend.kill(&id).await.unwrap();
    }
}
