//! In-memory repositories and a scripted tool for exercising workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    Issue, Job, JobRepository, JobStatus, RepositoryError, ResultRepository, ToolError,
    ToolOutput, ToolRunner,
};
use crate::message::JobId;

/// Mock job repository that keeps jobs in memory.
#[derive(Default)]
pub struct MockJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    fail_on_get: RwLock<bool>,
    fail_on_start: RwLock<bool>,
    fail_on_mark_failed: RwLock<bool>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    pub async fn job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub async fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.jobs.read().await.get(&job_id).map(|job| job.status)
    }

    pub async fn set_fail_on_get(&self, fail: bool) {
        *self.fail_on_get.write().await = fail;
    }

    pub async fn set_fail_on_start(&self, fail: bool) {
        *self.fail_on_start.write().await = fail;
    }

    pub async fn set_fail_on_mark_failed(&self, fail: bool) {
        *self.fail_on_mark_failed.write().await = fail;
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, RepositoryError> {
        if *self.fail_on_get.read().await {
            return Err(RepositoryError::Storage("get failed".to_string()));
        }
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn start(&self, job_id: JobId) -> Result<Job, RepositoryError> {
        if *self.fail_on_start.read().await {
            return Err(RepositoryError::Storage("start failed".to_string()));
        }
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(RepositoryError::NotFound(job_id))?;
        if !job.status.is_eligible() {
            return Err(RepositoryError::InvalidStatus {
                job_id,
                status: job.status,
            });
        }
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn mark_failed(&self, job_id: JobId) -> Result<(), RepositoryError> {
        if *self.fail_on_mark_failed.read().await {
            return Err(RepositoryError::Storage("mark_failed failed".to_string()));
        }
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(RepositoryError::NotFound(job_id))?;
        job.status = JobStatus::Failed;
        job.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// Mock result repository that records every stored result.
pub struct MockResultRepository<R> {
    stored: RwLock<Vec<(JobId, R)>>,
    fail_on_store: RwLock<bool>,
}

impl<R> Default for MockResultRepository<R> {
    fn default() -> Self {
        Self {
            stored: RwLock::new(Vec::new()),
            fail_on_store: RwLock::new(false),
        }
    }
}

impl<R: Clone> MockResultRepository<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stored(&self) -> Vec<(JobId, R)> {
        self.stored.read().await.clone()
    }

    pub async fn set_fail_on_store(&self, fail: bool) {
        *self.fail_on_store.write().await = fail;
    }
}

#[async_trait]
impl<R: Clone + Send + Sync> ResultRepository<R> for MockResultRepository<R> {
    async fn store_result(&self, job_id: JobId, result: &R) -> Result<(), RepositoryError> {
        if *self.fail_on_store.read().await {
            return Err(RepositoryError::Storage("store failed".to_string()));
        }
        self.stored.write().await.push((job_id, result.clone()));
        Ok(())
    }
}

/// What a [`ScriptedToolRunner`] does with the next jobs.
#[derive(Debug, Clone)]
pub enum ToolBehavior {
    /// Return the job configuration as result, with these issues.
    Succeed(Vec<Issue>),
    /// Fail while running the tool.
    Fail(String),
    /// Panic while running the tool.
    Panic(String),
    /// Fail before running the tool.
    FailPrepare(String),
}

/// Tool runner whose behavior is set by the test.
///
/// The result of a successful run is the job configuration, unchanged.
pub struct ScriptedToolRunner {
    behavior: RwLock<ToolBehavior>,
    prepared: AtomicUsize,
    runs: AtomicUsize,
}

impl Default for ScriptedToolRunner {
    fn default() -> Self {
        Self::new(ToolBehavior::Succeed(Vec::new()))
    }
}

impl ScriptedToolRunner {
    pub fn new(behavior: ToolBehavior) -> Self {
        Self {
            behavior: RwLock::new(behavior),
            prepared: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    pub async fn set_behavior(&self, behavior: ToolBehavior) {
        *self.behavior.write().await = behavior;
    }

    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    type Context = serde_json::Value;
    type Output = serde_json::Value;

    async fn prepare(&self, job: &Job) -> Result<serde_json::Value, ToolError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        if let ToolBehavior::FailPrepare(reason) = &*self.behavior.read().await {
            return Err(ToolError::Configuration(reason.clone()));
        }
        Ok(job.configuration.clone())
    }

    async fn run(
        &self,
        _job: &Job,
        context: serde_json::Value,
    ) -> Result<ToolOutput<serde_json::Value>, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.read().await.clone();
        match behavior {
            ToolBehavior::Succeed(issues) => Ok(ToolOutput::new(context).with_issues(issues)),
            ToolBehavior::Fail(reason) => Err(ToolError::Execution(reason)),
            ToolBehavior::Panic(reason) => panic!("{}", reason),
            ToolBehavior::FailPrepare(_) => Ok(ToolOutput::new(context)),
        }
    }
}
