//! A scheduler wired to a temp job store, a running engine and fake backends.

use std::sync::Arc;

use tempfile::TempDir;

use flowsched::backend::Backends;
use flowsched::engine::Engine;
use flowsched::scheduler::Scheduler;
use flowsched::store::JobStore;
use flowsched::workspace::{TaskKey, Workspace};

use crate::builders::WorkspaceBuilder;
use crate::fake_backend::FakeBackend;

pub struct Harness {
    pub scheduler: Scheduler,
    pub store: JobStore,
    pub backend: Arc<FakeBackend>,
    engine: Engine,
    _dir: TempDir,
}

impl Harness {
    /// Build the workspace under a fresh temp dir and start the engine. The
    /// same fake serves both backend kinds.
    pub async fn start(builder: WorkspaceBuilder, backend: FakeBackend) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let cfg = builder.root(dir.path()).try_build()?;
        let ws = Arc::new(Workspace::from_config(&cfg)?);

        let store = JobStore::open(&cfg.config.job_store).await?;
        store.purge_stale().await?;

        let backend = Arc::new(backend);
        let backends = Backends::new(backend.clone(), backend.clone());
        let engine = Engine::start(store.clone(), backends.clone(), &cfg.config);
        let scheduler = Scheduler::new(ws, store.clone(), backends);

        Ok(Self {
            scheduler,
            store,
            backend,
            engine,
            _dir: dir,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        self.scheduler.workspace()
    }

    /// Key of a task looked up by name inside a unit.
    pub fn key(&self, block: &str, version: &str, task: &str) -> TaskKey {
        self.workspace()
            .task_by_name(block, version, task)
            .map(|spec| spec.key.clone())
            .unwrap_or_else(|| panic!("no task {block}/{version}/{task}"))
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}
