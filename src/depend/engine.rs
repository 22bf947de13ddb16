// src/depend/engine.rs

//! Per-(block, version) registry of validated dependency expressions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use super::expr::{clean, parse};
use super::graph::{DependencyGraph, compile, find_cycle, find_paths_to};
use super::validate::find_duplicate_condition;
use super::DependencyError;

/// Cleaned expressions of one unit plus the graph compiled from them.
#[derive(Debug, Clone)]
pub struct UnitDependencies {
    pub block: String,
    pub version: String,
    /// Every task name of the unit, in declaration order.
    pub tasks: Vec<String>,
    /// Cleaned expression per task (empty string for no dependencies).
    pub expressions: BTreeMap<String, String>,
    pub graph: DependencyGraph,
}

impl UnitDependencies {
    fn build(
        block: &str,
        version: &str,
        tasks: Vec<String>,
        raw: &BTreeMap<String, String>,
    ) -> Result<Self, DependencyError> {
        let mut expressions = BTreeMap::new();

        for task in &tasks {
            let source = raw.get(task).map(String::as_str).unwrap_or("");
            let cleaned = clean(&tasks, task, source)?;
            if parse(source)?.to_string() != cleaned {
                warn!(
                    block,
                    version,
                    task = %task,
                    expr = %source,
                    cleaned = %cleaned,
                    "dependency expression references tasks outside this unit; dropped"
                );
            }
            if let Some(condition) = find_duplicate_condition(&parse(&cleaned)?) {
                return Err(DependencyError::DuplicateCondition {
                    task: task.clone(),
                    condition,
                });
            }
            expressions.insert(task.clone(), cleaned);
        }

        let graph = compile(block, version, &expressions)?;
        if let Some(node) = find_cycle(&graph) {
            return Err(DependencyError::Cycle {
                block: block.to_string(),
                version: version.to_string(),
                node: node.to_string(),
            });
        }

        Ok(Self {
            block: block.to_string(),
            version: version.to_string(),
            tasks,
            expressions,
            graph,
        })
    }
}

/// Holds the dependency state of every unit and applies expression changes
/// atomically: a rejected change leaves the previous state untouched.
#[derive(Debug, Default)]
pub struct DependencyEngine {
    units: RwLock<HashMap<(String, String), Arc<UnitDependencies>>>,
}

impl DependencyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install the full expression set of a unit.
    pub fn register_unit(
        &self,
        block: &str,
        version: &str,
        tasks: Vec<String>,
        raw: &BTreeMap<String, String>,
    ) -> Result<Arc<UnitDependencies>, DependencyError> {
        let unit = Arc::new(UnitDependencies::build(block, version, tasks, raw)?);
        self.units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((block.to_string(), version.to_string()), Arc::clone(&unit));
        Ok(unit)
    }

    /// Save new expressions for some tasks of a unit.
    ///
    /// The candidate set is cleaned, compiled and validated before anything
    /// is replaced. The write lock is held from snapshot to install, so
    /// concurrent saves apply one after another.
    pub fn apply(
        &self,
        block: &str,
        version: &str,
        updates: &BTreeMap<String, String>,
    ) -> Result<Arc<UnitDependencies>, DependencyError> {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let id = (block.to_string(), version.to_string());
        let current = units.get(&id).ok_or_else(|| DependencyError::UnknownUnit {
            block: block.to_string(),
            version: version.to_string(),
        })?;

        for task in updates.keys() {
            if !current.tasks.contains(task) {
                return Err(DependencyError::UnknownTask {
                    block: block.to_string(),
                    version: version.to_string(),
                    task: task.clone(),
                    dependency: task.clone(),
                });
            }
        }

        let mut candidate = current.expressions.clone();
        candidate.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));

        let unit = Arc::new(UnitDependencies::build(
            block,
            version,
            current.tasks.clone(),
            &candidate,
        )?);
        units.insert(id, Arc::clone(&unit));
        drop(units);

        info!(block, version, changed = updates.len(), "dependency expressions saved");
        Ok(unit)
    }

    pub fn unit(&self, block: &str, version: &str) -> Option<Arc<UnitDependencies>> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(block.to_string(), version.to_string()))
            .cloned()
    }

    /// Cleaned expression of one task.
    pub fn expression(&self, block: &str, version: &str, task: &str) -> Option<String> {
        self.unit(block, version)?.expressions.get(task).cloned()
    }

    pub fn paths_to(&self, block: &str, version: &str, task: &str) -> Vec<Vec<String>> {
        self.unit(block, version)
            .map(|u| find_paths_to(&u.graph, task))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn tasks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_cleans_foreign_tokens() {
        let engine = DependencyEngine::new();
        let unit = engine
            .register_unit("cpu", "v1", tasks(&["a", "b"]), &raw(&[("b", "a|elsewhere")]))
            .unwrap();
        assert_eq!(unit.expressions["b"], "a");
        assert_eq!(unit.expressions["a"], "");
    }

    #[test]
    fn rejected_cycle_leaves_previous_state() {
        let engine = DependencyEngine::new();
        engine
            .register_unit("cpu", "v1", tasks(&["a", "b"]), &raw(&[("b", "a")]))
            .unwrap();

        let err = engine
            .apply("cpu", "v1", &raw(&[("a", "b")]))
            .unwrap_err();
        assert!(matches!(err, DependencyError::Cycle { .. }));
        assert_eq!(engine.expression("cpu", "v1", "a").as_deref(), Some(""));
        assert_eq!(engine.expression("cpu", "v1", "b").as_deref(), Some("a"));
    }

    #[test]
    fn duplicate_condition_is_rejected_on_save() {
        let engine = DependencyEngine::new();
        engine
            .register_unit("cpu", "v1", tasks(&["a", "b", "c"]), &raw(&[]))
            .unwrap();
        let err = engine
            .apply("cpu", "v1", &raw(&[("c", "a|b|a")]))
            .unwrap_err();
        assert!(matches!(err, DependencyError::DuplicateCondition { .. }));
        assert_eq!(engine.expression("cpu", "v1", "c").as_deref(), Some(""));
    }

    #[test]
    fn accepted_change_is_visible() {
        let engine = DependencyEngine::new();
        engine
            .register_unit("cpu", "v1", tasks(&["a", "b", "c"]), &raw(&[]))
            .unwrap();
        engine.apply("cpu", "v1", &raw(&[("c", "a|b")])).unwrap();
        assert_eq!(engine.paths_to("cpu", "v1", "c").len(), 2);
    }

    #[test]
    fn concurrent_saves_all_land() {
        let names: Vec<String> = (0..=20).map(|i| format!("t{i}")).collect();
        let engine = DependencyEngine::new();
        engine
            .register_unit("cpu", "v1", names.clone(), &BTreeMap::new())
            .unwrap();

        std::thread::scope(|scope| {
            for i in 1..=20 {
                let engine = &engine;
                scope.spawn(move || {
                    let task = format!("t{i}");
                    engine.apply("cpu", "v1", &raw(&[(task.as_str(), "t0")])).unwrap();
                });
            }
        });

        for name in &names[1..] {
            assert_eq!(engine.expression("cpu", "v1", name).as_deref(), Some("t0"), "{name}");
        }
    }
}
