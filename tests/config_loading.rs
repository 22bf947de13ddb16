use std::error::Error;
use std::fs;
use std::path::Path;

use flowsched::config::loader::resolve_paths;
use flowsched::config::{ConfigFile, load_and_validate, load_from_path};
use flowsched::depend::DependencyError;
use flowsched::errors::FlowError;
use flowsched::types::{Action, BackendKind, RunType};
use flowsched::workspace::Workspace;
use flowsched_test_utils::builders::{TaskBuilder, UnitBuilder, WorkspaceBuilder};

type TestResult = Result<(), Box<dyn Error>>;

const WORKSPACE: &str = r#"
[config]
job_store = "state/jobs.db"
watch_interval_ms = 250

[[unit]]
block = "cpu"
version = "v1"
run_order = ["syn", "sta|pv"]

[[unit.task]]
name = "synth"
flow = "syn"

[unit.task.action.run]
command = "make synth"

[unit.task.action.check]
command = "make check_synth"
run_method = "cluster"

[[unit.task]]
name = "timing"
flow = "sta"
run_type = "parallel"
run_after = "synth"

[unit.task.action.run]
command = "make sta"
path = "sta"

[[unit.task]]
name = "drc"
flow = "pv"
run_type = "parallel"
run_after = "synth"

[unit.task.action.run]
command = "make drc"
"#;

#[test]
fn file_paths_are_anchored_to_the_workspace_dir() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("flowsched.toml");
    fs::write(&path, WORKSPACE)?;

    let cfg = load_and_validate(&path)?;

    assert_eq!(cfg.config.job_store, dir.path().join("state/jobs.db"));
    assert_eq!(cfg.config.watch_interval_ms, 250);
    let timing = &cfg.unit[0].task[1];
    assert_eq!(timing.run_type, RunType::Parallel);
    assert_eq!(
        timing.action[&Action::Run].path.as_deref(),
        Some(dir.path().join("sta").as_path())
    );
    Ok(())
}

#[test]
fn home_and_log_dir_overrides() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("flowsched.toml");
    fs::write(&path, WORKSPACE)?;

    let mut raw = load_from_path(&path)?;
    resolve_paths(
        &mut raw,
        Path::new("/ws"),
        Some("/opt/flowsched".into()),
        Some("/tmp/logs".into()),
    );
    let cfg = ConfigFile::try_from(raw)?;

    assert_eq!(cfg.config.job_store, Path::new("/opt/flowsched/state/jobs.db"));
    assert_eq!(cfg.config.log_dir, Path::new("/tmp/logs"));
    assert_eq!(cfg.config.result_root, Path::new("/ws/.flowsched/results"));
    Ok(())
}

#[test]
fn workspace_resolves_actions_and_groups() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("flowsched.toml");
    fs::write(&path, WORKSPACE)?;
    let ws = Workspace::from_config(&load_and_validate(&path)?)?;

    let synth = ws.task_by_name("cpu", "v1", "synth").ok_or("synth missing")?;
    assert_eq!(synth.resolve_action(Action::Run).map(|a| a.backend), Some(BackendKind::Local));
    assert_eq!(
        synth.resolve_action(Action::Check).map(|a| a.backend),
        Some(BackendKind::Cluster)
    );
    assert!(synth.resolve_action(Action::Release).is_none());

    let unit = ws.unit("cpu", "v1").ok_or("unit missing")?;
    assert_eq!(unit.bundle_of("pv"), Some(1));
    let groups = ws.groups_in_flow(unit, "sta");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].run_type, RunType::Parallel);

    assert_eq!(ws.dependencies.expression("cpu", "v1", "drc").as_deref(), Some("synth"));
    assert!(!ws.dependencies.paths_to("cpu", "v1", "timing").is_empty());
    Ok(())
}

fn rejects(builder: WorkspaceBuilder) -> FlowError {
    match builder.try_build() {
        Ok(_) => panic!("workspace should have been rejected"),
        Err(e) => e,
    }
}

#[test]
fn invalid_workspaces_are_rejected() {
    let err = rejects(WorkspaceBuilder::new());
    assert!(matches!(err, FlowError::ConfigError(_)), "{err}");

    let unit = || UnitBuilder::new("cpu", "v1", &["syn"]).task(TaskBuilder::new("a", "syn", "true"));
    let err = rejects(WorkspaceBuilder::new().unit(unit()).unit(unit()));
    assert!(matches!(err, FlowError::ConfigError(_)), "{err}");

    let err = rejects(
        WorkspaceBuilder::new().unit(
            UnitBuilder::new("cpu", "v1", &["syn"])
                .task(TaskBuilder::new("a", "syn", "true"))
                .task(TaskBuilder::new("a", "syn", "true")),
        ),
    );
    assert!(matches!(err, FlowError::ConfigError(_)), "{err}");

    let err = rejects(
        WorkspaceBuilder::new().unit(
            UnitBuilder::new("cpu", "v1", &["syn"])
                .task(TaskBuilder::new("a", "syn", "true"))
                .task(TaskBuilder::new("b", "syn", "true").parallel()),
        ),
    );
    assert!(matches!(err, FlowError::ConfigError(_)), "{err}");

    let err = rejects(
        WorkspaceBuilder::new().unit(
            UnitBuilder::new("cpu", "v1", &["syn"])
                .task(TaskBuilder::new("a", "syn", "true").run_after("b|b"))
                .task(TaskBuilder::new("b", "syn", "true").branch("alt")),
        ),
    );
    assert!(matches!(err, FlowError::Dependency(_)), "{err}");
}

#[test]
fn different_branches_form_separate_groups() -> TestResult {
    let cfg = WorkspaceBuilder::new()
        .unit(
            UnitBuilder::new("cpu", "v1", &["syn"])
                .task(TaskBuilder::new("a", "syn", "true"))
                .task(TaskBuilder::new("b", "syn", "true").branch("alt").parallel()),
        )
        .build();
    let ws = Workspace::from_config(&cfg)?;
    let unit = ws.unit("cpu", "v1").ok_or("unit missing")?;

    let groups = ws.groups_in_flow(unit, "syn");
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].run_type, RunType::Serial);
    assert_eq!(groups[1].run_type, RunType::Parallel);
    Ok(())
}

fn crossed_serial_groups(second: fn(TaskBuilder) -> TaskBuilder) -> WorkspaceBuilder {
    WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["syn"])
            .task(TaskBuilder::new("t1", "syn", "true").run_after("x2"))
            .task(TaskBuilder::new("t2", "syn", "true"))
            .task(second(TaskBuilder::new("x1", "syn", "true").branch("alt").run_after("t2")))
            .task(second(TaskBuilder::new("x2", "syn", "true").branch("alt"))),
    )
}

#[test]
fn serial_order_closing_a_wait_cycle_is_rejected() {
    // t1 waits for x2, x2 for x1 (serial), x1 for t2, t2 for t1 (serial).
    let cfg = crossed_serial_groups(|t| t).build();

    match Workspace::from_config(&cfg) {
        Err(FlowError::Dependency(DependencyError::Cycle { block, .. })) => assert_eq!(block, "cpu"),
        other => panic!("expected a wait cycle, got {other:?}"),
    }
}

#[test]
fn parallel_group_breaks_the_wait_cycle() -> TestResult {
    let cfg = crossed_serial_groups(TaskBuilder::parallel).build();
    let ws = Workspace::from_config(&cfg)?;
    assert!(ws.task_by_name("cpu", "v1", "x1").is_some());
    Ok(())
}
