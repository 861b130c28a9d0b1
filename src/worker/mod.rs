//! Worker job-execution protocol.
//!
//! Every worker kind runs the same state machine for an inbound job request:
//!
//! ```text
//! RECEIVED -> VALIDATED -> RUNNING -> SUCCEEDED | SUCCEEDED_WITH_ISSUES | FAILED
//!     \-> IGNORED
//! ```
//!
//! [`JobWorker`] implements it on top of the job and result repositories and
//! a [`ToolRunner`] holding the tool-specific logic. The outcome is a
//! [`RunResult`], which [`kinds::response_for`] maps to the message reported
//! to the orchestrator.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::component::panic_message;
use crate::config::{ConfigError, ConfigManager};
use crate::endpoint::EndpointDescriptor;
use crate::message::{JobId, RunId};

mod component;
pub mod kinds;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use component::{WorkerComponent, WorkerModules};
pub use kinds::{response_for, WorkerKind};

// ============================================================================
// Jobs
// ============================================================================

/// Persisted status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Scheduled,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    /// Whether a worker may start a job in this status.
    pub fn is_eligible(self) -> bool {
        matches!(self, JobStatus::Created | JobStatus::Scheduled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Created => "CREATED",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
        })
    }
}

/// One unit of pipeline work owned by a single worker kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    /// Tool configuration of the job, opaque to the protocol.
    pub configuration: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, run_id: RunId, status: JobStatus) -> Self {
        Self {
            id,
            run_id,
            configuration: serde_json::Value::Null,
            status,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }
}

// ============================================================================
// Tool output
// ============================================================================

/// Severity of an issue reported by a tool, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Hint,
    #[default]
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Hint => "HINT",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        })
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HINT" => Ok(Severity::Hint),
            "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            other => Err(format!("expected HINT, WARNING or ERROR, got '{}'", other)),
        }
    }
}

/// A problem reported by a tool while processing a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub source: String,
    pub message: String,
    pub severity: Severity,
}

impl Issue {
    pub fn new(source: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            severity,
        }
    }
}

/// What a tool produced for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput<T> {
    pub result: T,
    pub issues: Vec<Issue>,
}

impl<T> ToolOutput<T> {
    pub fn new(result: T) -> Self {
        Self {
            result,
            issues: Vec::new(),
        }
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }

    /// Whether any issue is at least as severe as `threshold`.
    pub fn has_issues_at_or_above(&self, threshold: Severity) -> bool {
        self.issues.iter().any(|issue| issue.severity >= threshold)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Why a job failed.
#[derive(Clone)]
pub struct FailureCause {
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl FailureCause {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an error, prefixing its message with `context`.
    pub fn from_error<E>(context: &str, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: format!("{}: {}", context, error),
            source: Some(Arc::new(error)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str("unknown failure")
        } else {
            f.write_str(&self.message)
        }
    }
}

impl fmt::Debug for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureCause")
            .field("message", &self.message)
            .field("source", &self.source.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Outcome of one job execution attempt.
#[derive(Debug, Clone)]
pub enum RunResult {
    /// Completed without issues at or above the threshold.
    Success,
    /// Completed, but the tool reported issues at or above the threshold.
    FinishedWithIssues,
    /// Could not complete.
    Failed(FailureCause),
    /// Duplicate, stale or otherwise not actionable. Not reported upstream.
    Ignored(String),
}

// ============================================================================
// Collaborators
// ============================================================================

/// Errors raised by job and result repositories.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {job_id} has status {status} and cannot be started")]
    InvalidStatus { job_id: JobId, status: JobStatus },

    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Errors raised by tool logic.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid job configuration: {0}")]
    Configuration(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Persistence of jobs of one worker kind.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, RepositoryError>;

    /// Move a job into `RUNNING`.
    ///
    /// Fails with [`RepositoryError::InvalidStatus`] if the job is no longer
    /// eligible, e.g. because a duplicate delivery already started it.
    async fn start(&self, job_id: JobId) -> Result<Job, RepositoryError>;

    async fn mark_failed(&self, job_id: JobId) -> Result<(), RepositoryError>;
}

/// Persistence of the results a tool produces.
#[async_trait]
pub trait ResultRepository<R: Send + Sync>: Send + Sync {
    async fn store_result(&self, job_id: JobId, result: &R) -> Result<(), RepositoryError>;
}

/// The tool-specific part of a worker.
#[async_trait]
pub trait ToolRunner: Send + Sync + 'static {
    /// Everything the tool needs besides the job itself.
    type Context: Send;
    /// The result record the tool produces.
    type Output: Send + Sync;

    /// Resolve configuration and prior stage results for `job`.
    async fn prepare(&self, job: &Job) -> Result<Self::Context, ToolError>;

    async fn run(
        &self,
        job: &Job,
        context: Self::Context,
    ) -> Result<ToolOutput<Self::Output>, ToolError>;
}

// ============================================================================
// Settings
// ============================================================================

/// Configuration key, below `<endpoint>.worker`, of the issue threshold.
pub const ISSUE_THRESHOLD_KEY: &str = "issue_threshold";

/// Tuning of a worker, read from `<endpoint>.worker.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerSettings {
    /// Issues at or above this severity make a run `FinishedWithIssues`.
    pub issue_threshold: Severity,
}

impl WorkerSettings {
    pub fn from_config(
        endpoint: &EndpointDescriptor,
        config: &ConfigManager,
    ) -> Result<Self, ConfigError> {
        let key = format!("{}.worker.{}", endpoint.config_prefix(), ISSUE_THRESHOLD_KEY);
        Ok(Self {
            issue_threshold: config.parse_or(&key, Severity::default())?,
        })
    }
}

// ============================================================================
// Job worker
// ============================================================================

/// Runs the job state machine for one worker kind.
pub struct JobWorker<R: ToolRunner> {
    jobs: Arc<dyn JobRepository>,
    results: Arc<dyn ResultRepository<R::Output>>,
    runner: R,
    settings: WorkerSettings,
}

impl<R: ToolRunner> JobWorker<R> {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        results: Arc<dyn ResultRepository<R::Output>>,
        runner: R,
    ) -> Self {
        Self {
            jobs,
            results,
            runner,
            settings: WorkerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> WorkerSettings {
        self.settings
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Process the job with id `job_id`.
    ///
    /// Never fails: every problem is reported through the returned
    /// [`RunResult`].
    pub async fn run(&self, job_id: JobId) -> RunResult {
        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return RunResult::Ignored(format!("Job {} not found", job_id)),
            // Status is unknown, so the job is left untouched.
            Err(e) => return RunResult::Failed(FailureCause::from_error("Failed to read job", e)),
        };

        if !job.status.is_eligible() {
            return RunResult::Ignored(format!(
                "Job {} has status {} and is not eligible for processing",
                job_id, job.status
            ));
        }

        let job = match self.jobs.start(job_id).await {
            Ok(job) => job,
            Err(e @ RepositoryError::InvalidStatus { .. }) => {
                return RunResult::Ignored(e.to_string())
            }
            Err(e) => {
                return self
                    .fail(job_id, FailureCause::from_error("Failed to start job", e))
                    .await
            }
        };
        debug!(job_id, run_id = job.run_id, "Job started");

        let outcome = AssertUnwindSafe(self.execute(&job)).catch_unwind().await;

        match outcome {
            Ok(Ok(false)) => RunResult::Success,
            Ok(Ok(true)) => RunResult::FinishedWithIssues,
            Ok(Err(cause)) => self.fail(job_id, cause).await,
            Err(panic) => {
                let cause = FailureCause::new(format!(
                    "Tool panicked: {}",
                    panic_message(panic.as_ref())
                ));
                self.fail(job_id, cause).await
            }
        }
    }

    /// Prepare, run and store. Returns whether the tool reported issues at or
    /// above the threshold.
    async fn execute(&self, job: &Job) -> Result<bool, FailureCause> {
        let context = self
            .runner
            .prepare(job)
            .await
            .map_err(|e| FailureCause::from_error("Failed to prepare job", e))?;

        let output = self
            .runner
            .run(job, context)
            .await
            .map_err(|e| FailureCause::from_error("Tool failed", e))?;

        self.results
            .store_result(job.id, &output.result)
            .await
            .map_err(|e| FailureCause::from_error("Failed to store result", e))?;

        let threshold = self.settings.issue_threshold;
        if !output.issues.is_empty() {
            debug!(
                issues = output.issues.len(),
                threshold = %threshold,
                "Tool reported issues"
            );
        }
        Ok(output.has_issues_at_or_above(threshold))
    }

    async fn fail(&self, job_id: JobId, cause: FailureCause) -> RunResult {
        debug!(job_id, "Marking job as failed");
        if let Err(e) = self.jobs.mark_failed(job_id).await {
            error!(job_id, error = %e, "Failed to mark job as failed");
        }
        RunResult::Failed(cause)
    }
}

#[cfg(test)]
mod tests;
