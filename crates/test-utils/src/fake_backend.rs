//! In-memory [`Backend`] whose jobs end the way a test tells them to.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use flowsched::backend::{Backend, BackendState, Submission};
use flowsched::errors::BackendError;
use flowsched::types::BackendKind;

/// How a fake job behaves, keyed by task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOutcome {
    /// Reports Running once, then Done.
    Pass,
    /// Reports Running once, then Exit with this code.
    Fail(i32),
    /// Stays Running until killed.
    Hang,
    /// Submission itself fails.
    RejectSubmit,
    /// Reports a state the watcher does not understand, forever.
    Unknown,
}

#[derive(Debug)]
struct FakeJob {
    task: String,
    outcome: FakeOutcome,
    polls: usize,
    killed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    outcomes: HashMap<String, FakeOutcome>,
    jobs: HashMap<String, FakeJob>,
    submitted: Vec<String>,
    killed: Vec<String>,
    next_id: u64,
}

#[derive(Debug)]
pub struct FakeBackend {
    kind: BackendKind,
    default: FakeOutcome,
    inner: Mutex<Inner>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            default: FakeOutcome::Pass,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_outcome(self, task: &str, outcome: FakeOutcome) -> Self {
        self.set_outcome(task, outcome);
        self
    }

    pub fn set_outcome(&self, task: &str, outcome: FakeOutcome) {
        self.inner
            .lock()
            .unwrap()
            .outcomes
            .insert(task.to_string(), outcome);
    }

    /// Task names in submission order.
    pub fn submitted(&self) -> Vec<String> {
        self.inner.lock().unwrap().submitted.clone()
    }

    pub fn submission_count(&self, task: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .submitted
            .iter()
            .filter(|t| *t == task)
            .count()
    }

    /// Let the submitted jobs of `task` finish successfully from now on.
    pub fn release(&self, task: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.outcomes.insert(task.to_string(), FakeOutcome::Pass);
        for job in inner.jobs.values_mut().filter(|j| j.task == task) {
            job.outcome = FakeOutcome::Pass;
        }
    }

    /// Task names whose job received a kill.
    pub fn killed(&self) -> Vec<String> {
        self.inner.lock().unwrap().killed.clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn submit(&self, submission: &Submission) -> Result<String, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let task = submission.job.task.clone();
        let outcome = inner.outcomes.get(&task).copied().unwrap_or(self.default);
        inner.submitted.push(task.clone());
        if outcome == FakeOutcome::RejectSubmit {
            return Err(BackendError::EmptySubmission);
        }

        inner.next_id += 1;
        let id = format!("fake-{}", inner.next_id);
        inner.jobs.insert(
            id.clone(),
            FakeJob {
                task,
                outcome,
                polls: 0,
                killed: false,
            },
        );
        Ok(id)
    }

    async fn query(&self, job_ids: &[String]) -> Result<HashMap<String, BackendState>, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let mut states = HashMap::new();
        for id in job_ids {
            let Some(job) = inner.jobs.get_mut(id) else {
                continue;
            };
            job.polls += 1;
            let state = if job.killed {
                BackendState::Exit(Some(130))
            } else {
                match (job.outcome, job.polls) {
                    (FakeOutcome::Unknown, _) => BackendState::Other("UNKWN".into()),
                    (_, 1) | (FakeOutcome::Hang, _) => BackendState::Running,
                    (FakeOutcome::Fail(code), _) => BackendState::Exit(Some(code)),
                    _ => BackendState::Done,
                }
            };
            states.insert(id.clone(), state);
        }
        Ok(states)
    }

    async fn kill(&self, job_id: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Err(BackendError::Kill {
                job_id: job_id.to_string(),
                detail: "no such job".to_string(),
            });
        };
        job.killed = true;
        let task = job.task.clone();
        inner.killed.push(task);
        Ok(())
    }
}
