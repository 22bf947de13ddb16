// src/workspace/model.rs

//! Typed task arena built from a validated [`ConfigFile`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::backend::result_file::result_path;
use crate::config::model::{ActionConfig, ClusterSection, ConfigFile, ConfigSection};
use crate::depend::{DependencyEngine, DependencyError, parse};
use crate::errors::{FlowError, Result};
use crate::types::{Action, BackendKind, RunType};

use super::board::StatusBoard;

/// Composite identity of a task: `(block, version, flow, task)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub block: String,
    pub version: String,
    pub flow: String,
    pub task: String,
}

impl TaskKey {
    pub fn new(block: &str, version: &str, flow: &str, task: &str) -> Self {
        Self {
            block: block.to_string(),
            version: version.to_string(),
            flow: flow.to_string(),
            task: task.to_string(),
        }
    }

    pub fn unit(&self) -> (&str, &str) {
        (&self.block, &self.version)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.block, self.version, self.flow, self.task)
    }
}

/// Identity of a scheduling group: tasks sharing it run under one run-type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub block: String,
    pub version: String,
    pub flow: String,
    pub vendor: String,
    pub branch: String,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}[{}:{}]",
            self.block, self.version, self.flow, self.vendor, self.branch
        )
    }
}

/// Index of a task inside the workspace arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

/// Static description of one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub key: TaskKey,
    pub vendor: String,
    pub branch: String,
    pub run_type: RunType,
    pub backend: BackendKind,
    /// Dependency expression as written in the workspace file.
    pub run_after: String,
    pub actions: BTreeMap<Action, ActionConfig>,
}

/// An action with its backend and working directory decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAction {
    pub action: Action,
    pub command: String,
    pub cwd: PathBuf,
    pub backend: BackendKind,
}

impl TaskSpec {
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            block: self.key.block.clone(),
            version: self.key.version.clone(),
            flow: self.key.flow.clone(),
            vendor: self.vendor.clone(),
            branch: self.branch.clone(),
        }
    }

    pub fn has_action(&self, action: Action) -> bool {
        self.actions.contains_key(&action)
    }

    pub fn resolve_action(&self, action: Action) -> Option<ResolvedAction> {
        let cfg = self.actions.get(&action)?;
        Some(ResolvedAction {
            action,
            command: cfg.command.clone(),
            cwd: cfg.path.clone().unwrap_or_else(|| PathBuf::from(".")),
            backend: cfg.run_method.unwrap_or(self.backend),
        })
    }
}

/// One scheduling group of a flow, members in declaration order.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    pub key: GroupKey,
    pub run_type: RunType,
    pub members: Vec<TaskKey>,
}

/// A (block, version) with its run order and tasks.
#[derive(Debug, Clone)]
pub struct Unit {
    pub block: String,
    pub version: String,
    pub bundles: Vec<Vec<String>>,
    /// Task keys in declaration order.
    pub tasks: Vec<TaskKey>,
}

impl Unit {
    pub fn tasks_in_flow<'a>(&'a self, flow: &'a str) -> impl Iterator<Item = &'a TaskKey> + 'a {
        self.tasks.iter().filter(move |k| k.flow == flow)
    }

    pub fn tasks_in_bundle<'a>(&'a self, index: usize) -> impl Iterator<Item = &'a TaskKey> + 'a {
        let flows = self.bundles.get(index).map(Vec::as_slice).unwrap_or(&[]);
        self.tasks
            .iter()
            .filter(move |k| flows.iter().any(|f| *f == k.flow))
    }

    /// Index of the bundle holding `flow`.
    pub fn bundle_of(&self, flow: &str) -> Option<usize> {
        self.bundles
            .iter()
            .position(|bundle| bundle.iter().any(|f| f == flow))
    }
}

/// Everything a run needs: configuration, task arena, dependency engine and
/// status board. Shared as `Arc<Workspace>`.
#[derive(Debug)]
pub struct Workspace {
    pub config: ConfigSection,
    pub cluster: ClusterSection,
    pub units: Vec<Unit>,
    pub dependencies: DependencyEngine,
    pub board: StatusBoard,
    arena: Vec<TaskSpec>,
    index: HashMap<TaskKey, TaskId>,
    by_name: HashMap<(String, String, String), TaskId>,
}

impl Workspace {
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let dependencies = DependencyEngine::new();
        let mut arena = Vec::new();
        let mut index = HashMap::new();
        let mut by_name = HashMap::new();
        let mut units = Vec::new();

        for unit_cfg in &cfg.unit {
            let mut keys = Vec::with_capacity(unit_cfg.task.len());
            let mut raw = BTreeMap::new();

            for task in &unit_cfg.task {
                let key = TaskKey::new(&unit_cfg.block, &unit_cfg.version, &task.flow, &task.name);
                let id = TaskId(arena.len());
                arena.push(TaskSpec {
                    key: key.clone(),
                    vendor: task.vendor.clone(),
                    branch: task.branch.clone(),
                    run_type: task.run_type,
                    backend: task.backend,
                    run_after: task.run_after.clone(),
                    actions: task.action.clone(),
                });
                index.insert(key.clone(), id);
                by_name.insert(
                    (
                        unit_cfg.block.clone(),
                        unit_cfg.version.clone(),
                        task.name.clone(),
                    ),
                    id,
                );
                raw.insert(task.name.clone(), task.run_after.clone());
                keys.push(key);
            }

            let names = unit_cfg.task.iter().map(|t| t.name.clone()).collect();
            dependencies.register_unit(&unit_cfg.block, &unit_cfg.version, names, &raw)?;

            units.push(Unit {
                block: unit_cfg.block.clone(),
                version: unit_cfg.version.clone(),
                bundles: unit_cfg.bundles(),
                tasks: keys,
            });
        }

        let board = StatusBoard::new(index.keys().cloned());

        let ws = Self {
            config: cfg.config.clone(),
            cluster: cfg.cluster.clone(),
            units,
            dependencies,
            board,
            arena,
            index,
            by_name,
        };
        for unit in &ws.units {
            ws.check_waits(unit)?;
        }
        Ok(ws)
    }

    /// Reject a unit whose tasks could wait on each other forever.
    ///
    /// Inside a bundle a task waits for its dependencies and, in a serial
    /// group, for the member before it. The expressions alone can be acyclic
    /// while the two kinds of wait together close a circle.
    fn check_waits(&self, unit: &Unit) -> Result<()> {
        for (index, flows) in unit.bundles.iter().enumerate() {
            let groups: Vec<TaskGroup> = flows
                .iter()
                .flat_map(|flow| self.groups_in_flow(unit, flow))
                .collect();

            let mut waits: DiGraphMap<&str, ()> = DiGraphMap::new();
            for key in unit.tasks_in_bundle(index) {
                waits.add_node(key.task.as_str());
            }
            for group in groups.iter().filter(|g| g.run_type == RunType::Serial) {
                for pair in group.members.windows(2) {
                    waits.add_edge(pair[0].task.as_str(), pair[1].task.as_str(), ());
                }
            }

            for group in &groups {
                let serial = group.run_type == RunType::Serial;
                for (position, key) in group.members.iter().enumerate() {
                    let expr = self
                        .dependencies
                        .expression(&unit.block, &unit.version, &key.task)
                        .unwrap_or_default();
                    for dep in parse(&expr)?.task_names() {
                        // Dependencies outside the bundle, or at or after this
                        // member in its serial group, are never waited for.
                        let Some(node) = waits.nodes().find(|n| *n == dep) else {
                            continue;
                        };
                        if serial && group.members[position..].iter().any(|m| m.task == dep) {
                            continue;
                        }
                        waits.add_edge(node, key.task.as_str(), ());
                    }
                }
            }

            if let Err(cycle) = toposort(&waits, None) {
                return Err(DependencyError::Cycle {
                    block: unit.block.clone(),
                    version: unit.version.clone(),
                    node: cycle.node_id().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn task(&self, key: &TaskKey) -> Option<&TaskSpec> {
        self.index.get(key).map(|id| &self.arena[id.0])
    }

    pub fn require_task(&self, key: &TaskKey) -> Result<&TaskSpec> {
        self.task(key)
            .ok_or_else(|| FlowError::TaskNotFound(key.to_string()))
    }

    /// Look a task up by its name inside a unit.
    pub fn task_by_name(&self, block: &str, version: &str, name: &str) -> Option<&TaskSpec> {
        self.by_name
            .get(&(block.to_string(), version.to_string(), name.to_string()))
            .map(|id| &self.arena[id.0])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.arena.iter()
    }

    pub fn unit(&self, block: &str, version: &str) -> Option<&Unit> {
        self.units
            .iter()
            .find(|u| u.block == block && u.version == version)
    }

    /// Groups of a flow, in order of first declaration.
    pub fn groups_in_flow(&self, unit: &Unit, flow: &str) -> Vec<TaskGroup> {
        let mut groups: Vec<TaskGroup> = Vec::new();
        for key in unit.tasks_in_flow(flow) {
            let Some(spec) = self.task(key) else {
                continue;
            };
            let group_key = spec.group_key();
            match groups.iter_mut().find(|g| g.key == group_key) {
                Some(group) => group.members.push(key.clone()),
                None => groups.push(TaskGroup {
                    key: group_key,
                    run_type: spec.run_type,
                    members: vec![key.clone()],
                }),
            }
        }
        groups
    }

    /// Where a task action writes its JSON result.
    pub fn result_file(&self, key: &TaskKey, action: Action) -> PathBuf {
        result_path(
            &self.config.result_root,
            &key.block,
            &key.version,
            &key.task,
            action,
        )
    }
}
