use std::error::Error;
use std::time::Duration;

use flowsched::scheduler::{RunOptions, RunSummary, Selection};
use flowsched::errors::FlowError;
use flowsched::types::{Action, BackendKind, JobStatus, TaskStatus};
use flowsched_test_utils::builders::{TaskBuilder, UnitBuilder, WorkspaceBuilder};
use flowsched_test_utils::fake_backend::{FakeBackend, FakeOutcome};
use flowsched_test_utils::harness::Harness;
use flowsched_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn fake() -> FakeBackend {
    FakeBackend::new(BackendKind::Local)
}

async fn run_all(h: &Harness) -> Result<RunSummary, Box<dyn Error>> {
    let options = RunOptions::from_config(&h.workspace().config);
    Ok(with_timeout(h.scheduler.run(&Selection::default(), options)).await?)
}

fn status(h: &Harness, summary: &RunSummary, task: &str) -> Option<TaskStatus> {
    summary.status(&h.key("cpu", "v1", task))
}

#[tokio::test]
async fn failing_bundle_cancels_every_later_bundle() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["a", "b|c", "d"])
            .task(TaskBuilder::new("ta", "a", "true"))
            .task(TaskBuilder::new("tb", "b", "true"))
            .task(TaskBuilder::new("tc", "c", "true"))
            .task(TaskBuilder::new("td", "d", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("ta", FakeOutcome::Fail(1))).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "ta"), Some(TaskStatus::Fail));
    for task in ["tb", "tc", "td"] {
        assert_eq!(status(&h, &summary, task), Some(TaskStatus::Cancelled), "{task}");
    }
    assert_eq!(h.backend.submitted(), ["ta"]);
    assert!(!summary.is_success(&h.workspace().config.run_fail_markers));

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn without_fail_fast_later_bundles_still_run() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().fail_fast(false).unit(
        UnitBuilder::new("cpu", "v1", &["a", "b"])
            .task(TaskBuilder::new("ta", "a", "true"))
            .task(TaskBuilder::new("tb", "b", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("ta", FakeOutcome::Fail(1))).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "ta"), Some(TaskStatus::Fail));
    assert_eq!(status(&h, &summary, "tb"), Some(TaskStatus::Pass));
    assert_eq!(h.backend.submitted(), ["ta", "tb"]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn serial_group_stops_at_first_failure() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["syn"])
            .task(TaskBuilder::new("t1", "syn", "true"))
            .task(TaskBuilder::new("t2", "syn", "true"))
            .task(TaskBuilder::new("t3", "syn", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("t1", FakeOutcome::Fail(1))).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "t1"), Some(TaskStatus::Fail));
    assert_eq!(status(&h, &summary, "t2"), Some(TaskStatus::Cancelled));
    assert_eq!(status(&h, &summary, "t3"), Some(TaskStatus::Cancelled));
    assert_eq!(h.backend.submitted(), ["t1"]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn ignore_fail_keeps_serial_group_going() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().ignore_fail(true).unit(
        UnitBuilder::new("cpu", "v1", &["syn"])
            .task(TaskBuilder::new("t1", "syn", "true"))
            .task(TaskBuilder::new("t2", "syn", "true"))
            .task(TaskBuilder::new("t3", "syn", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("t1", FakeOutcome::Fail(1))).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "t1"), Some(TaskStatus::Fail));
    assert_eq!(status(&h, &summary, "t2"), Some(TaskStatus::Pass));
    assert_eq!(status(&h, &summary, "t3"), Some(TaskStatus::Pass));
    assert_eq!(h.backend.submitted(), ["t1", "t2", "t3"]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn parallel_members_are_independent() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["sta"])
            .task(TaskBuilder::new("p1", "sta", "true").parallel())
            .task(TaskBuilder::new("p2", "sta", "true").parallel()),
    );
    let h = Harness::start(builder, fake().with_outcome("p1", FakeOutcome::Fail(2))).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "p1"), Some(TaskStatus::Fail));
    assert_eq!(status(&h, &summary, "p2"), Some(TaskStatus::Pass));

    let failed = h.store.list(Some(JobStatus::Failed)).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].exit_code, Some(2));

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn dependencies_order_parallel_members() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["sta"])
            .task(TaskBuilder::new("late", "sta", "true").parallel().run_after("early"))
            .task(TaskBuilder::new("early", "sta", "true").parallel()),
    );
    let h = Harness::start(builder, fake()).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "late"), Some(TaskStatus::Pass));
    assert_eq!(h.backend.submitted(), ["early", "late"]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_dependency_cancels_dependent() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["sta"])
            .task(TaskBuilder::new("a", "sta", "true").parallel())
            .task(TaskBuilder::new("b", "sta", "true").parallel().run_after("a")),
    );
    let h = Harness::start(builder, fake().with_outcome("a", FakeOutcome::Fail(1))).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "b"), Some(TaskStatus::Cancelled));
    assert_eq!(h.backend.submission_count("b"), 0);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn one_passing_alternative_is_enough() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["sta"])
            .task(TaskBuilder::new("a", "sta", "true").parallel())
            .task(TaskBuilder::new("b", "sta", "true").parallel())
            .task(TaskBuilder::new("c", "sta", "true").parallel().run_after("a|b")),
    );
    let h = Harness::start(builder, fake().with_outcome("a", FakeOutcome::Fail(1))).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "c"), Some(TaskStatus::Pass));

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unselected_dependency_counts_as_met() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["sta"])
            .task(TaskBuilder::new("a", "sta", "true").parallel())
            .task(TaskBuilder::new("b", "sta", "true").parallel().run_after("a")),
    );
    let h = Harness::start(builder, fake()).await?;

    let selection = Selection {
        tasks: vec!["b".to_string()],
        ..Selection::default()
    };
    let options = RunOptions::from_config(&h.workspace().config);
    let summary = with_timeout(h.scheduler.run(&selection, options)).await?;

    assert_eq!(summary.tasks.len(), 1);
    assert_eq!(status(&h, &summary, "b"), Some(TaskStatus::Pass));
    assert_eq!(h.backend.submitted(), ["b"]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn dry_run_submits_nothing() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["a", "b"])
            .task(TaskBuilder::new("ta", "a", "true"))
            .task(TaskBuilder::new("tb", "b", "true")),
    );
    let h = Harness::start(builder, fake()).await?;

    let mut options = RunOptions::from_config(&h.workspace().config);
    options.dry_run = true;
    let summary = with_timeout(h.scheduler.run(&Selection::default(), options)).await?;

    assert_eq!(summary.count(TaskStatus::Pass), 2);
    assert!(h.backend.submitted().is_empty());
    assert!(h.store.list(None).await?.is_empty());

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejected_submission_fails_after_grace() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["syn"]).task(TaskBuilder::new("t", "syn", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("t", FakeOutcome::RejectSubmit)).await?;

    let summary = run_all(&h).await?;

    assert_eq!(status(&h, &summary, "t"), Some(TaskStatus::Fail));
    let jobs = h.store.list(None).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].job_id, None);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn kill_stops_a_running_task() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["syn", "sta"])
            .task(TaskBuilder::new("hang", "syn", "true"))
            .task(TaskBuilder::new("next", "sta", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("hang", FakeOutcome::Hang)).await?;
    let key = h.key("cpu", "v1", "hang");

    let scheduler = h.scheduler.clone();
    let options = RunOptions::from_config(&h.workspace().config);
    let run = tokio::spawn(async move { scheduler.run(&Selection::default(), options).await });

    with_timeout(async {
        while h.store.list(Some(JobStatus::Running)).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert_eq!(h.scheduler.kill(&key)?, TaskStatus::Killing);
    let summary = with_timeout(run).await??;

    assert_eq!(summary.status(&key), Some(TaskStatus::Killed));
    assert_eq!(status(&h, &summary, "next"), Some(TaskStatus::Cancelled));
    assert_eq!(h.backend.killed(), ["hang"]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn kill_all_cancels_queued_tasks() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().fail_fast(false).unit(
        UnitBuilder::new("cpu", "v1", &["syn", "sta"])
            .task(TaskBuilder::new("hang", "syn", "true"))
            .task(TaskBuilder::new("next", "sta", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("hang", FakeOutcome::Hang)).await?;

    let scheduler = h.scheduler.clone();
    let options = RunOptions::from_config(&h.workspace().config);
    let run = tokio::spawn(async move { scheduler.run(&Selection::default(), options).await });

    with_timeout(async {
        while h.store.list(Some(JobStatus::Running)).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    h.scheduler.kill_all();
    let summary = with_timeout(run).await??;

    assert_eq!(status(&h, &summary, "hang"), Some(TaskStatus::Killed));
    assert_eq!(status(&h, &summary, "next"), Some(TaskStatus::Cancelled));
    assert_eq!(h.backend.submission_count("next"), 0);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn serial_group_waits_for_a_member_already_running() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["syn"])
            .task(TaskBuilder::new("t1", "syn", "true"))
            .task(TaskBuilder::new("t2", "syn", "true"))
            .task(TaskBuilder::new("t3", "syn", "true")),
    );
    let h = Harness::start(builder, fake().with_outcome("t2", FakeOutcome::Hang)).await?;
    let t1 = h.key("cpu", "v1", "t1");
    let t2 = h.key("cpu", "v1", "t2");

    let scheduler = h.scheduler.clone();
    let single = {
        let t2 = t2.clone();
        tokio::spawn(async move { scheduler.run_action(&t2, Action::Run).await })
    };
    with_timeout(async {
        while h.store.list(Some(JobStatus::Running)).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(h.workspace().board.status(&t2), TaskStatus::Running);

    let scheduler = h.scheduler.clone();
    let options = RunOptions::from_config(&h.workspace().config);
    let run = tokio::spawn(async move { scheduler.run(&Selection::default(), options).await });

    with_timeout(async {
        while h.workspace().board.status(&t1) != TaskStatus::Pass {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    h.backend.release("t2");

    let summary = with_timeout(run).await??;
    assert_eq!(with_timeout(single).await??, TaskStatus::Pass);
    assert_eq!(summary.status(&t2), Some(TaskStatus::Pass));
    assert_eq!(status(&h, &summary, "t3"), Some(TaskStatus::Pass));
    assert_eq!(h.backend.submission_count("t2"), 1);
    assert_eq!(h.backend.submitted(), ["t2", "t1", "t3"]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn run_action_ignores_dependencies() -> TestResult {
    init_tracing();
    let builder = WorkspaceBuilder::new().unit(
        UnitBuilder::new("cpu", "v1", &["syn", "sta"])
            .task(TaskBuilder::new("a", "syn", "true"))
            .task(TaskBuilder::new("b", "sta", "true").parallel().run_after("a")),
    );
    let h = Harness::start(builder, fake().with_outcome("b", FakeOutcome::Fail(3))).await?;
    let a = h.key("cpu", "v1", "a");
    let b = h.key("cpu", "v1", "b");

    let status = with_timeout(h.scheduler.run_action(&b, Action::Run)).await?;

    assert_eq!(status, TaskStatus::Fail);
    assert_eq!(h.backend.submitted(), ["b"]);
    assert_eq!(h.workspace().board.status(&a), TaskStatus::Undefined);
    let jobs = h.store.list(None).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!((jobs[0].status, jobs[0].exit_code), (JobStatus::Failed, Some(3)));

    let err = h.scheduler.run_action(&b, Action::Check).await.unwrap_err();
    assert!(matches!(err, FlowError::ConfigError(_)), "{err}");

    h.shutdown().await;
    Ok(())
}
