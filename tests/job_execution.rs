// tests/job_execution.rs

mod common;
use crate::common::init_tracing;
use crate::common::sql_summary::{build_sql_summary_job, email_notification, SqlSummaryJobParams};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use jobdag::{Context, JobDefinition, JobErrorCode, StepOptions, StepState, TaskError};

type TestResult = Result<(), Box<dyn Error>>;

/// Upper bound on how long any wait in these tests may take.
const WAIT_BOUND: Duration = Duration::from_secs(5);

#[tokio::test]
async fn simple_job_completes_and_merges_results() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(None)?;
    let instance = job
        .definition
        .start(&Context::new(), SqlSummaryJobParams::new("server1"))?;

    timeout(WAIT_BOUND, instance.wait()).await??;

    let summary = timeout(WAIT_BOUND, instance.result_of(&job.summarize)).await??;
    assert_eq!(summary.data1.get("serverName"), Some(&"server1".to_string()));
    assert_eq!(summary.data1.get("tableName"), Some(&"table1".to_string()));
    assert_eq!(summary.data1.get("queryName"), Some(&"query1".to_string()));
    assert_eq!(summary.data2.get("tableName"), Some(&"table2".to_string()));
    assert_eq!(summary.data2.get("queryName"), Some(&"query2".to_string()));

    for name in ["serverName", "GetConnection", "QueryTable1", "QueryTable2", "Summarize"] {
        let step = instance.step(name).expect("step instance present");
        assert_eq!(step.state(), StepState::Completed, "step {name}");
        let execution = step.execution_data();
        assert!(execution.start_time.is_some(), "step {name} was invoked");
    }

    let rendered = instance.visualize();
    assert!(rendered.contains("digraph"));
    assert!(rendered.contains("\"Summarize\""));
    assert!(rendered.contains("\"QueryTable1\" -> \"Summarize\""));

    Ok(())
}

#[tokio::test]
async fn failing_step_fails_dependents_only() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(None)?;
    let params = SqlSummaryJobParams::new("server1")
        .with_error("GetTableClient.server1.table1", "table1 not exists");
    let instance = job.definition.start(&Context::new(), params)?;

    let err = timeout(WAIT_BOUND, instance.wait())
        .await?
        .expect_err("job must fail");
    assert_eq!(err.code(), JobErrorCode::StepFailed);
    assert_eq!(
        err.step_instance().expect("step attributed").name(),
        "GetTableClient1"
    );
    assert_eq!(
        err.user_error().expect("user error exposed").to_string(),
        "table1 not exists"
    );

    // The independent branch still completed.
    let query2 = instance.step("QueryTable2").expect("step present");
    assert_eq!(query2.state(), StepState::Completed);

    // Dependents of the failing step were skipped with a precedent error.
    let summarize = instance.step("Summarize").expect("step present");
    assert_eq!(summarize.state(), StepState::Failed);
    assert!(
        summarize.execution_data().start_time.is_none(),
        "summarize body must not have been invoked"
    );
    let summarize_err = timeout(WAIT_BOUND, instance.result_of(&job.summarize))
        .await?
        .expect_err("summarize must fail");
    assert_eq!(summarize_err.code(), JobErrorCode::PrecedentStepFailure);

    Ok(())
}

#[tokio::test]
async fn auth_failure_gates_both_query_steps() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(None)?;
    let params = SqlSummaryJobParams::new("server1").with_error("CheckAuth", "auth denied");
    let instance = job.definition.start(&Context::new(), params)?;

    let err = timeout(WAIT_BOUND, instance.wait())
        .await?
        .expect_err("job must fail");
    assert_eq!(err.code(), JobErrorCode::StepFailed);
    assert_eq!(
        err.step_instance().expect("step attributed").name(),
        "CheckAuth"
    );
    assert_eq!(
        err.user_error().expect("user error").to_string(),
        "auth denied"
    );

    // CheckAuth gates the query steps as an ordering-only dependency:
    // their data parents succeeded, so the failure must come through the
    // instrumented body's predecessor gate.
    let q1_err = timeout(WAIT_BOUND, instance.result_of(&job.query_table1))
        .await?
        .expect_err("QueryTable1 must be skipped");
    assert_eq!(q1_err.code(), JobErrorCode::PrecedentStepFailure);
    let q2_err = timeout(WAIT_BOUND, instance.result_of(&job.query_table2))
        .await?
        .expect_err("QueryTable2 must be skipped");
    assert_eq!(q2_err.code(), JobErrorCode::PrecedentStepFailure);

    for name in ["QueryTable1", "QueryTable2"] {
        let step = instance.step(name).expect("step present");
        assert_eq!(step.state(), StepState::Failed, "step {name}");
        assert!(
            step.execution_data().start_time.is_none(),
            "step {name} body must not have been invoked"
        );
    }
    assert_eq!(
        instance.step("GetTableClient1").expect("step present").state(),
        StepState::Completed
    );

    Ok(())
}

#[tokio::test]
async fn panic_in_step_is_recovered() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(None)?;
    let params =
        SqlSummaryJobParams::new("server1").with_panic("GetTableClient.server1.table2");
    let instance = job.definition.start(&Context::new(), params)?;

    let err = timeout(WAIT_BOUND, instance.wait())
        .await?
        .expect_err("job must fail");
    assert_eq!(err.code(), JobErrorCode::StepFailed);
    assert_eq!(
        err.step_instance().expect("step attributed").name(),
        "GetTableClient2"
    );
    match err.cause() {
        Some(TaskError::PanicRecovered { message, .. }) => {
            assert!(message.contains("injected panic"));
        }
        other => panic!("expected PanicRecovered cause, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn retry_exhaustion_reports_attempts() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(Some((Duration::from_millis(3), 3)))?;
    assert!(!job.definition.sealed());

    let params = SqlSummaryJobParams::new("server1").with_error(
        "ExecuteQuery.server1.table1.query1",
        "query exceeded memory limit",
    );
    let instance = job.definition.start(&Context::new(), params)?;
    assert!(job.definition.sealed());

    let err = timeout(WAIT_BOUND, instance.wait())
        .await?
        .expect_err("job must fail");
    assert_eq!(err.code(), JobErrorCode::StepFailed);
    let step = err.step_instance().expect("step attributed");
    assert_eq!(step.name(), "QueryTable1");

    let retried = step
        .execution_data()
        .retried
        .expect("retry report recorded");
    assert_eq!(retried.count, 3);
    assert!(retried
        .last_error
        .as_deref()
        .is_some_and(|message| message.contains("query exceeded memory limit")));

    Ok(())
}

#[tokio::test]
async fn retries_stop_once_step_succeeds() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(Some((Duration::from_millis(3), 5)))?;
    let params = SqlSummaryJobParams::new("server1")
        .with_flaky("ExecuteQuery.server1.table1.query1", 2);
    let instance = job.definition.start(&Context::new(), params)?;

    timeout(WAIT_BOUND, instance.wait()).await??;

    let step = instance.step("QueryTable1").expect("step present");
    assert_eq!(step.state(), StepState::Completed);
    let retried = step
        .execution_data()
        .retried
        .expect("retry report recorded");
    assert_eq!(retried.count, 2);

    Ok(())
}

#[tokio::test]
async fn builders_fail_after_first_start() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(None)?;
    let instance = job
        .definition
        .start(&Context::new(), SqlSummaryJobParams::new("server1"))?;
    assert!(job.definition.sealed());

    let err = job
        .definition
        .add_step::<(), _, _>("EmailNotification2", email_notification, StepOptions::new())
        .expect_err("sealed definition must reject new steps");
    assert_eq!(err.code(), JobErrorCode::JobSealed);

    timeout(WAIT_BOUND, instance.wait()).await??;
    Ok(())
}

#[tokio::test]
async fn two_instances_do_not_share_execution_data() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(None)?;

    let instance1 = job
        .definition
        .start(&Context::new(), SqlSummaryJobParams::new("server1"))?;
    let mut params2 = SqlSummaryJobParams::new("server2");
    params2.table1 = "table3".to_string();
    params2.query1 = "query3".to_string();
    let instance2 = job.definition.start(&Context::new(), params2)?;

    let (first, second) = timeout(
        WAIT_BOUND,
        futures::future::join(instance1.wait(), instance2.wait()),
    )
    .await?;
    first?;
    second?;

    let summary1 = timeout(WAIT_BOUND, instance1.result_of(&job.summarize)).await??;
    let summary2 = timeout(WAIT_BOUND, instance2.result_of(&job.summarize)).await??;
    assert_eq!(summary1.data1.get("serverName"), Some(&"server1".to_string()));
    assert_eq!(summary2.data1.get("serverName"), Some(&"server2".to_string()));
    assert_eq!(summary2.data1.get("tableName"), Some(&"table3".to_string()));

    Ok(())
}

#[tokio::test]
async fn cancel_terminates_in_flight_steps_promptly() -> TestResult {
    init_tracing();

    let job = JobDefinition::<()>::new("cancelable");
    let slow = job.add_step(
        "slow",
        |_ctx: Context| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::Ok(1u32)
        },
        StepOptions::new(),
    )?;
    let _dependent = job.step_after(
        "dependent",
        &slow,
        |_ctx, value: Arc<u32>| async move { anyhow::Ok(*value + 1) },
        StepOptions::new(),
    )?;

    let instance = job.start(&Context::new(), ())?;
    instance.cancel();

    let err = timeout(Duration::from_secs(3), instance.wait())
        .await?
        .expect_err("canceled job must fail");
    assert_eq!(err.code(), JobErrorCode::JobCanceled);
    assert_eq!(
        instance.step("dependent").expect("step present").state(),
        StepState::Failed
    );

    Ok(())
}

#[tokio::test]
async fn wait_is_idempotent() -> TestResult {
    init_tracing();

    let job = build_sql_summary_job(None)?;
    let params = SqlSummaryJobParams::new("server1")
        .with_error("GetTableClient.server1.table1", "table1 not exists");
    let instance = job.definition.start(&Context::new(), params)?;

    let first = timeout(WAIT_BOUND, instance.wait())
        .await?
        .expect_err("job must fail");
    let second = timeout(WAIT_BOUND, instance.wait())
        .await?
        .expect_err("job must fail again");

    assert_eq!(first.code(), second.code());
    assert_eq!(
        first.step_instance().expect("step").name(),
        second.step_instance().expect("step").name()
    );

    Ok(())
}

#[test]
fn duplicate_step_name_is_rejected() {
    init_tracing();

    let job = JobDefinition::<()>::new("dups");
    job.add_step("a", email_notification, StepOptions::new())
        .expect("first add succeeds");
    let err = job
        .add_step::<(), _, _>("a", email_notification, StepOptions::new())
        .expect_err("same name must be rejected");
    assert_eq!(err.code(), JobErrorCode::DuplicateStep);
}

#[test]
fn step_handle_from_another_job_is_rejected() {
    init_tracing();

    let job_a = JobDefinition::<()>::new("job-a");
    let step_a = job_a
        .add_step("shared", email_notification, StepOptions::new())
        .expect("add succeeds");

    let job_b = JobDefinition::<()>::new("job-b");
    let err = job_b
        .step_after::<(), (), _, _>(
            "follower",
            &step_a,
            |_ctx, _value: Arc<()>| async move { anyhow::Ok(()) },
            StepOptions::new(),
        )
        .expect_err("foreign handle must be rejected");
    assert_eq!(err.code(), JobErrorCode::StepNotFound);
}

#[test]
fn definition_visualization_is_deterministic() {
    init_tracing();

    let job = build_sql_summary_job(None).expect("job builds");
    let before = job.definition.visualize();
    job.definition.seal();
    let after = job.definition.visualize();

    assert_eq!(before, after);
    assert!(before.contains("\"root\""));
    assert!(before.contains("\"CheckAuth\" -> \"QueryTable1\""));
}
