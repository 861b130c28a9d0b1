//! Message envelope and payload catalogue.
//!
//! Every message is a [`MessageHeader`] plus a typed payload. Transports only
//! ever see the [`RawMessage`] form, in which the payload has already been
//! converted to a JSON value; the typed form exists at the edges, where
//! application code publishes and handlers receive.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifier of a job (one unit of work of a single worker kind).
pub type JobId = i64;

/// Identifier of a pipeline run.
pub type RunId = i64;

/// Marker for types that can travel as message payloads.
pub trait Payload: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {}

/// Header attached to every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Opaque bearer credential, forwarded unchanged.
    #[serde(default)]
    pub token: String,
    /// Correlation id shared by a request and every response derived from it.
    pub trace_id: String,
    /// The pipeline run this message belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl MessageHeader {
    /// Create a header without a token.
    pub fn new(trace_id: impl Into<String>, run_id: Option<RunId>) -> Self {
        Self {
            token: String::new(),
            trace_id: trace_id.into(),
            run_id,
        }
    }

    /// Create a header with a freshly generated trace id.
    pub fn with_new_trace(run_id: Option<RunId>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), run_id)
    }

    /// Attach a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

/// A header together with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    pub header: MessageHeader,
    pub payload: T,
}

/// The transport-level form of a message.
pub type RawMessage = Message<serde_json::Value>;

impl<T> Message<T> {
    pub fn new(header: MessageHeader, payload: T) -> Self {
        Self { header, payload }
    }
}

impl<T: Payload> Message<T> {
    /// Convert into the form handed to transports.
    pub fn encode(&self) -> Result<RawMessage, serde_json::Error> {
        Ok(Message {
            header: self.header.clone(),
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}

impl RawMessage {
    /// Convert a received message into its typed form.
    pub fn decode<T: Payload>(self) -> Result<Message<T>, serde_json::Error> {
        Ok(Message {
            header: self.header,
            payload: serde_json::from_value(self.payload)?,
        })
    }
}

// ============================================================================
// Worker requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerRequest {
    pub analyzer_job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorRequest {
    pub advisor_job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerRequest {
    pub scanner_job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorRequest {
    pub evaluator_job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReporterRequest {
    pub reporter_job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierRequest {
    pub notifier_job_id: JobId,
}

/// Asks the config service to resolve the configuration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub run_id: RunId,
}

// ============================================================================
// Coordinator-bound messages
// ============================================================================

/// Successful completion of a worker job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub job_id: JobId,
    /// Set when the tool reported issues at or above the worker's threshold.
    #[serde(default)]
    pub has_issues: bool,
}

impl WorkerResult {
    pub fn new(job_id: JobId, has_issues: bool) -> Self {
        Self { job_id, has_issues }
    }
}

/// Failure of a worker job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerError {
    pub job_id: JobId,
    #[serde(default)]
    pub error: String,
}

impl WorkerError {
    pub fn new(job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigWorkerResult {
    pub run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigWorkerError {
    pub run_id: RunId,
    #[serde(default)]
    pub error: String,
}

/// Everything the orchestrator endpoint accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorMessage {
    ConfigWorkerResult(ConfigWorkerResult),
    ConfigWorkerError(ConfigWorkerError),
    AnalyzerWorkerResult(WorkerResult),
    AnalyzerWorkerError(WorkerError),
    AdvisorWorkerResult(WorkerResult),
    AdvisorWorkerError(WorkerError),
    ScannerWorkerResult(WorkerResult),
    ScannerWorkerError(WorkerError),
    EvaluatorWorkerResult(WorkerResult),
    EvaluatorWorkerError(WorkerError),
    ReporterWorkerResult(WorkerResult),
    ReporterWorkerError(WorkerError),
    NotifierWorkerResult(WorkerResult),
    NotifierWorkerError(WorkerError),
}

impl OrchestratorMessage {
    /// The job this message reports on, for job-based workers.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::ConfigWorkerResult(_) | Self::ConfigWorkerError(_) => None,
            Self::AnalyzerWorkerResult(r)
            | Self::AdvisorWorkerResult(r)
            | Self::ScannerWorkerResult(r)
            | Self::EvaluatorWorkerResult(r)
            | Self::ReporterWorkerResult(r)
            | Self::NotifierWorkerResult(r) => Some(r.job_id),
            Self::AnalyzerWorkerError(e)
            | Self::AdvisorWorkerError(e)
            | Self::ScannerWorkerError(e)
            | Self::EvaluatorWorkerError(e)
            | Self::ReporterWorkerError(e)
            | Self::NotifierWorkerError(e) => Some(e.job_id),
        }
    }

    /// Whether this message reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigWorkerError(_)
                | Self::AnalyzerWorkerError(_)
                | Self::AdvisorWorkerError(_)
                | Self::ScannerWorkerError(_)
                | Self::EvaluatorWorkerError(_)
                | Self::ReporterWorkerError(_)
                | Self::NotifierWorkerError(_)
        )
    }
}
