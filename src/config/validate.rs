// src/config/validate.rs

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::model::{ConfigFile, RawConfigFile, UnitConfig};
use crate::depend::DependencyEngine;
use crate::depend::expr::{ALT_SEP, AND_SEP, REPEAT_SEP};
use crate::errors::{FlowError, Result};
use crate::types::RunType;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = FlowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.config, raw.cluster, raw.unit))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_units(cfg)?;
    validate_global_config(cfg)?;
    let mut seen = HashSet::new();
    for unit in &cfg.unit {
        if !seen.insert((unit.block.as_str(), unit.version.as_str())) {
            return Err(FlowError::ConfigError(format!(
                "unit {}/{} is declared more than once",
                unit.block, unit.version
            )));
        }
        validate_unit_tasks(unit)?;
        validate_groups(unit)?;
        validate_dependencies(unit)?;
    }
    Ok(())
}

fn ensure_has_units(cfg: &RawConfigFile) -> Result<()> {
    if cfg.unit.is_empty() {
        return Err(FlowError::ConfigError(
            "workspace must contain at least one [[unit]] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    let c = &cfg.config;
    for (name, value) in [
        ("dispatch_interval_ms", c.dispatch_interval_ms),
        ("watch_interval_ms", c.watch_interval_ms),
        ("task_poll_interval_ms", c.task_poll_interval_ms),
    ] {
        if value == 0 {
            return Err(FlowError::ConfigError(format!(
                "[config].{name} must be >= 1 (got 0)"
            )));
        }
    }

    if c.submit_workers == 0 {
        return Err(FlowError::ConfigError(
            "[config].submit_workers must be >= 1 (got 0)".to_string(),
        ));
    }

    regex::Regex::new(&cfg.cluster.job_id_pattern).map_err(|e| {
        FlowError::ConfigError(format!("invalid [cluster].job_id_pattern: {e}"))
    })?;

    Ok(())
}

fn validate_unit_tasks(unit: &UnitConfig) -> Result<()> {
    let scope = format!("{}/{}", unit.block, unit.version);
    let bundles = unit.bundles();

    if bundles.is_empty() || bundles.iter().any(Vec::is_empty) {
        return Err(FlowError::ConfigError(format!(
            "unit {scope} has an empty run_order bundle"
        )));
    }

    let flows: HashSet<&str> = bundles.iter().flatten().map(String::as_str).collect();
    let mut names = HashSet::new();

    for task in &unit.task {
        if task.name.trim().is_empty() {
            return Err(FlowError::ConfigError(format!(
                "unit {scope} has a task with an empty name"
            )));
        }
        if task
            .name
            .chars()
            .any(|c| c == REPEAT_SEP || c == ALT_SEP || c == AND_SEP || c.is_whitespace())
        {
            return Err(FlowError::ConfigError(format!(
                "task name '{}' in {scope} must not contain ',', '|', '&' or whitespace",
                task.name
            )));
        }
        if !names.insert(task.name.as_str()) {
            return Err(FlowError::ConfigError(format!(
                "task '{}' is declared twice in {scope}",
                task.name
            )));
        }
        if !flows.contains(task.flow.as_str()) {
            return Err(FlowError::ConfigError(format!(
                "task '{}' in {scope} belongs to flow '{}' which is not in run_order",
                task.name, task.flow
            )));
        }
        if task.action.is_empty() {
            return Err(FlowError::ConfigError(format!(
                "task '{}' in {scope} defines no action",
                task.name
            )));
        }
    }

    Ok(())
}

/// All members of one (flow, vendor, branch) group must agree on run-type.
fn validate_groups(unit: &UnitConfig) -> Result<()> {
    let mut run_types: HashMap<(&str, &str, &str), RunType> = HashMap::new();
    for task in &unit.task {
        let key = (task.flow.as_str(), task.vendor.as_str(), task.branch.as_str());
        match run_types.get(&key) {
            Some(existing) if *existing != task.run_type => {
                return Err(FlowError::ConfigError(format!(
                    "task '{}' in {}/{} disagrees with its group on run_type",
                    task.name, unit.block, unit.version
                )));
            }
            Some(_) => {}
            None => {
                run_types.insert(key, task.run_type);
            }
        }
    }
    Ok(())
}

fn validate_dependencies(unit: &UnitConfig) -> Result<()> {
    let tasks: Vec<String> = unit.task.iter().map(|t| t.name.clone()).collect();
    let raw: BTreeMap<String, String> = unit
        .task
        .iter()
        .map(|t| (t.name.clone(), t.run_after.clone()))
        .collect();

    DependencyEngine::new().register_unit(&unit.block, &unit.version, tasks, &raw)?;
    Ok(())
}
