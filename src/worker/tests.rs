use super::testing::{MockJobRepository, MockResultRepository, ScriptedToolRunner, ToolBehavior};
use super::*;
use crate::endpoint::SCANNER;
use serde_json::json;

struct Fixture {
    jobs: Arc<MockJobRepository>,
    results: Arc<MockResultRepository<serde_json::Value>>,
    worker: JobWorker<ScriptedToolRunner>,
}

async fn fixture(behavior: ToolBehavior, status: JobStatus) -> Fixture {
    let jobs = Arc::new(MockJobRepository::new());
    jobs.insert(Job::new(1, 10, status).with_configuration(json!({ "paths": ["src"] })))
        .await;
    let results = Arc::new(MockResultRepository::new());
    let worker = JobWorker::new(
        jobs.clone(),
        results.clone(),
        ScriptedToolRunner::new(behavior),
    );
    Fixture {
        jobs,
        results,
        worker,
    }
}

fn issue(severity: Severity) -> Issue {
    Issue::new("lint", "line too long", severity)
}

// ============================================================================
// Completed runs
// ============================================================================

#[tokio::test]
async fn test_success_stores_result() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Scheduled).await;

    let result = f.worker.run(1).await;

    assert!(matches!(result, RunResult::Success));
    assert_eq!(f.results.stored().await, vec![(1, json!({ "paths": ["src"] }))]);
    let job = f.jobs.job(1).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.started_at.is_some());
}

#[tokio::test]
async fn test_created_job_is_eligible() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Created).await;

    assert!(matches!(f.worker.run(1).await, RunResult::Success));
}

#[tokio::test]
async fn test_issue_at_threshold_reports_issues() {
    let f = fixture(
        ToolBehavior::Succeed(vec![issue(Severity::Hint), issue(Severity::Warning)]),
        JobStatus::Scheduled,
    )
    .await;

    assert!(matches!(f.worker.run(1).await, RunResult::FinishedWithIssues));
    assert_eq!(f.results.stored().await.len(), 1);
}

#[tokio::test]
async fn test_issues_below_threshold_are_success() {
    let f = fixture(
        ToolBehavior::Succeed(vec![issue(Severity::Warning)]),
        JobStatus::Scheduled,
    )
    .await;
    let worker = f.worker.with_settings(WorkerSettings {
        issue_threshold: Severity::Error,
    });

    assert!(matches!(worker.run(1).await, RunResult::Success));
}

// ============================================================================
// Ignored runs
// ============================================================================

#[tokio::test]
async fn test_missing_job_is_ignored() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Scheduled).await;

    let result = f.worker.run(99).await;

    assert!(matches!(result, RunResult::Ignored(_)));
    assert_eq!(f.worker.runner().prepared(), 0);
}

#[tokio::test]
async fn test_stale_status_is_ignored_without_side_effects() {
    for status in [JobStatus::Running, JobStatus::Finished, JobStatus::Failed] {
        let f = fixture(ToolBehavior::Succeed(vec![]), status).await;

        let result = f.worker.run(1).await;

        match result {
            RunResult::Ignored(reason) => assert!(reason.contains(&status.to_string())),
            other => panic!("expected Ignored for {}, got {:?}", status, other),
        }
        assert_eq!(f.jobs.status(1).await, Some(status));
        assert_eq!(f.worker.runner().runs(), 0);
        assert!(f.results.stored().await.is_empty());
    }
}

#[tokio::test]
async fn test_duplicate_delivery_runs_once() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Scheduled).await;

    assert!(matches!(f.worker.run(1).await, RunResult::Success));
    assert!(matches!(f.worker.run(1).await, RunResult::Ignored(_)));
    assert_eq!(f.worker.runner().runs(), 1);
}

/// A repository that reports the job as eligible but refuses to start it,
/// as when a concurrent delivery wins the race.
struct RacingJobRepository;

#[async_trait]
impl JobRepository for RacingJobRepository {
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, RepositoryError> {
        Ok(Some(Job::new(job_id, 1, JobStatus::Scheduled)))
    }

    async fn start(&self, job_id: JobId) -> Result<Job, RepositoryError> {
        Err(RepositoryError::InvalidStatus {
            job_id,
            status: JobStatus::Running,
        })
    }

    async fn mark_failed(&self, _job_id: JobId) -> Result<(), RepositoryError> {
        panic!("a lost start race must not fail the job");
    }
}

#[tokio::test]
async fn test_lost_start_race_is_ignored() {
    let worker = JobWorker::new(
        Arc::new(RacingJobRepository),
        Arc::new(MockResultRepository::<serde_json::Value>::new()),
        ScriptedToolRunner::default(),
    );

    assert!(matches!(worker.run(4).await, RunResult::Ignored(_)));
    assert_eq!(worker.runner().prepared(), 0);
}

// ============================================================================
// Failed runs
// ============================================================================

async fn assert_failed(f: &Fixture, result: RunResult, expected: &str) {
    match result {
        RunResult::Failed(cause) => assert!(
            cause.to_string().contains(expected),
            "'{}' does not mention '{}'",
            cause,
            expected
        ),
        other => panic!("expected Failed, got {:?}", other),
    }
    let job = f.jobs.job(1).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn test_tool_error_fails_job() {
    let f = fixture(ToolBehavior::Fail("exit code 2".into()), JobStatus::Scheduled).await;

    let result = f.worker.run(1).await;

    assert_failed(&f, result, "exit code 2").await;
    assert!(f.results.stored().await.is_empty());
}

#[tokio::test]
async fn test_tool_panic_fails_job() {
    let f = fixture(ToolBehavior::Panic("index out of bounds".into()), JobStatus::Scheduled).await;

    let result = f.worker.run(1).await;

    assert_failed(&f, result, "index out of bounds").await;
}

#[tokio::test]
async fn test_prepare_error_fails_job_before_running() {
    let f = fixture(
        ToolBehavior::FailPrepare("no analyzer result".into()),
        JobStatus::Scheduled,
    )
    .await;

    let result = f.worker.run(1).await;

    assert_failed(&f, result, "no analyzer result").await;
    assert_eq!(f.worker.runner().runs(), 0);
}

#[tokio::test]
async fn test_store_error_fails_job() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Scheduled).await;
    f.results.set_fail_on_store(true).await;

    let result = f.worker.run(1).await;

    assert_failed(&f, result, "store failed").await;
}

#[tokio::test]
async fn test_start_error_fails_job() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Scheduled).await;
    f.jobs.set_fail_on_start(true).await;

    let result = f.worker.run(1).await;

    assert_failed(&f, result, "start failed").await;
    assert_eq!(f.worker.runner().prepared(), 0);
}

#[tokio::test]
async fn test_read_error_reports_failure_without_status_change() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Scheduled).await;
    f.jobs.set_fail_on_get(true).await;

    let result = f.worker.run(1).await;

    match result {
        RunResult::Failed(cause) => assert!(cause.to_string().contains("get failed")),
        other => panic!("expected Failed, got {:?}", other),
    }
    let job = f.jobs.job(1).await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert!(job.finished_at.is_none());
    assert_eq!(f.worker.runner().prepared(), 0);
}

#[tokio::test]
async fn test_read_error_leaves_finished_job_finished() {
    let f = fixture(ToolBehavior::Succeed(vec![]), JobStatus::Finished).await;
    f.jobs.set_fail_on_get(true).await;

    let result = f.worker.run(1).await;

    assert!(matches!(result, RunResult::Failed(_)));
    assert_eq!(f.jobs.status(1).await, Some(JobStatus::Finished));
    assert_eq!(f.worker.runner().prepared(), 0);
}

#[tokio::test]
async fn test_mark_failed_error_still_reports_failure() {
    let f = fixture(ToolBehavior::Fail("boom".into()), JobStatus::Scheduled).await;
    f.jobs.set_fail_on_mark_failed(true).await;

    let result = f.worker.run(1).await;

    assert!(matches!(result, RunResult::Failed(_)));
    assert_eq!(f.jobs.status(1).await, Some(JobStatus::Running));
}

#[test]
fn test_failure_cause_keeps_source() {
    let cause = FailureCause::from_error("Tool failed", ToolError::Execution("oops".into()));

    assert_eq!(cause.message(), "Tool failed: Tool execution failed: oops");
    assert!(cause.source().is_some());
    assert_eq!(FailureCause::new("").to_string(), "unknown failure");
}

// ============================================================================
// Settings and severities
// ============================================================================

#[test]
fn test_settings_default_to_warning() {
    let config = ConfigManager::from_map(Vec::<(String, String)>::new());

    let settings = WorkerSettings::from_config(SCANNER.descriptor(), &config).unwrap();

    assert_eq!(settings.issue_threshold, Severity::Warning);
}

#[test]
fn test_settings_read_threshold() {
    let config = ConfigManager::from_map([("scanner.worker.issue_threshold", "error")]);

    let settings = WorkerSettings::from_config(SCANNER.descriptor(), &config).unwrap();

    assert_eq!(settings.issue_threshold, Severity::Error);
}

#[test]
fn test_settings_reject_unknown_severity() {
    let config = ConfigManager::from_map([("scanner.worker.issue_threshold", "fatal")]);

    let err = WorkerSettings::from_config(SCANNER.descriptor(), &config).unwrap_err();

    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(err.to_string().contains("fatal"));
}

#[test]
fn test_severity_order_and_parsing() {
    assert!(Severity::Hint < Severity::Warning);
    assert!(Severity::Warning < Severity::Error);
    assert_eq!("Hint".parse::<Severity>().unwrap(), Severity::Hint);
    assert!("".parse::<Severity>().is_err());
    assert_eq!(
        serde_json::to_value(Severity::Error).unwrap(),
        json!("ERROR")
    );
}

#[test]
fn test_job_status_eligibility() {
    assert!(JobStatus::Created.is_eligible());
    assert!(JobStatus::Scheduled.is_eligible());
    assert!(!JobStatus::Running.is_eligible());
    assert_eq!(
        serde_json::to_value(JobStatus::Scheduled).unwrap(),
        json!("SCHEDULED")
    );
}
