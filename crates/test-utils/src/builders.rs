#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use flowsched::config::{
    ActionConfig, ClusterSection, ConfigFile, ConfigSection, RawConfigFile, TaskConfig, UnitConfig,
};
use flowsched::types::{Action, BackendKind, RunType, TaskStatus};

/// Builder for `ConfigFile` with timings short enough for tests.
pub struct WorkspaceBuilder {
    config: RawConfigFile,
}

impl WorkspaceBuilder {
    pub fn new() -> Self {
        let config = ConfigSection {
            dispatch_interval_ms: 10,
            watch_interval_ms: 10,
            task_poll_interval_ms: 10,
            orphan_grace_ms: 200,
            ..ConfigSection::default()
        };
        Self {
            config: RawConfigFile {
                config,
                cluster: ClusterSection::default(),
                unit: Vec::new(),
            },
        }
    }

    /// Put the job store, logs and result files under `root`.
    pub fn root(mut self, root: &Path) -> Self {
        self.config.config.job_store = root.join("jobs.db");
        self.config.config.log_dir = root.join("logs");
        self.config.config.result_root = root.join("results");
        for unit in &mut self.config.unit {
            for task in &mut unit.task {
                for action in task.action.values_mut() {
                    action.path.get_or_insert_with(|| root.to_path_buf());
                }
            }
        }
        self
    }

    pub fn fail_fast(mut self, val: bool) -> Self {
        self.config.config.fail_fast = val;
        self
    }

    pub fn ignore_fail(mut self, val: bool) -> Self {
        self.config.config.ignore_fail = val;
        self
    }

    pub fn run_fail_markers(mut self, markers: &[TaskStatus]) -> Self {
        self.config.config.run_fail_markers = markers.to_vec();
        self
    }

    pub fn unit(mut self, unit: UnitBuilder) -> Self {
        self.config.unit.push(unit.build());
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> flowsched::errors::Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        self.try_build()
            .expect("Failed to build valid config from builder")
    }
}

impl Default for WorkspaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one `[[unit]]`.
pub struct UnitBuilder {
    unit: UnitConfig,
}

impl UnitBuilder {
    pub fn new(block: &str, version: &str, run_order: &[&str]) -> Self {
        Self {
            unit: UnitConfig {
                block: block.to_string(),
                version: version.to_string(),
                run_order: run_order.iter().map(|s| s.to_string()).collect(),
                task: Vec::new(),
            },
        }
    }

    pub fn task(mut self, task: TaskBuilder) -> Self {
        self.unit.task.push(task.build());
        self
    }

    pub fn build(self) -> UnitConfig {
        self.unit
    }
}

/// Builder for `TaskConfig`.
pub struct TaskBuilder {
    task: TaskConfig,
}

impl TaskBuilder {
    /// A task with a RUN action executing `cmd`.
    pub fn new(name: &str, flow: &str, cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                name: name.to_string(),
                flow: flow.to_string(),
                vendor: String::new(),
                branch: String::new(),
                run_type: RunType::Serial,
                backend: BackendKind::Local,
                run_after: String::new(),
                action: BTreeMap::new(),
            },
        }
        .action(Action::Run, cmd)
    }

    pub fn action(mut self, action: Action, cmd: &str) -> Self {
        self.task.action.insert(
            action,
            ActionConfig {
                command: cmd.to_string(),
                path: None,
                run_method: None,
            },
        );
        self
    }

    pub fn run_after(mut self, expr: &str) -> Self {
        self.task.run_after = expr.to_string();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.task.run_type = RunType::Parallel;
        self
    }

    pub fn branch(mut self, branch: &str) -> Self {
        self.task.branch = branch.to_string();
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.task.backend = backend;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}
