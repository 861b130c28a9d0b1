//! The six worker kinds and the mapping of outcomes to responses.

use crate::endpoint::{Endpoint, ADVISOR, ANALYZER, EVALUATOR, NOTIFIER, REPORTER, SCANNER};
use crate::message::{
    AdvisorRequest, AnalyzerRequest, EvaluatorRequest, JobId, Message, MessageHeader,
    NotifierRequest, OrchestratorMessage, Payload, ReporterRequest, ScannerRequest, WorkerError,
    WorkerResult,
};

use super::RunResult;

/// Binds a worker kind to its endpoint, request payload and response messages.
pub trait WorkerKind: Send + Sync + 'static {
    type Request: Payload;

    fn endpoint() -> &'static Endpoint<Self::Request>;

    fn job_id(request: &Self::Request) -> JobId;

    fn result_message(result: WorkerResult) -> OrchestratorMessage;

    fn error_message(error: WorkerError) -> OrchestratorMessage;
}

macro_rules! worker_kind {
    ($kind:ident, $endpoint:ident, $request:ty, $field:ident, $result:ident, $error:ident) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $kind;

        impl WorkerKind for $kind {
            type Request = $request;

            fn endpoint() -> &'static Endpoint<$request> {
                &$endpoint
            }

            fn job_id(request: &$request) -> JobId {
                request.$field
            }

            fn result_message(result: WorkerResult) -> OrchestratorMessage {
                OrchestratorMessage::$result(result)
            }

            fn error_message(error: WorkerError) -> OrchestratorMessage {
                OrchestratorMessage::$error(error)
            }
        }
    };
}

worker_kind!(
    Analyzer,
    ANALYZER,
    AnalyzerRequest,
    analyzer_job_id,
    AnalyzerWorkerResult,
    AnalyzerWorkerError
);
worker_kind!(
    Advisor,
    ADVISOR,
    AdvisorRequest,
    advisor_job_id,
    AdvisorWorkerResult,
    AdvisorWorkerError
);
worker_kind!(
    Scanner,
    SCANNER,
    ScannerRequest,
    scanner_job_id,
    ScannerWorkerResult,
    ScannerWorkerError
);
worker_kind!(
    Evaluator,
    EVALUATOR,
    EvaluatorRequest,
    evaluator_job_id,
    EvaluatorWorkerResult,
    EvaluatorWorkerError
);
worker_kind!(
    Reporter,
    REPORTER,
    ReporterRequest,
    reporter_job_id,
    ReporterWorkerResult,
    ReporterWorkerError
);
worker_kind!(
    Notifier,
    NOTIFIER,
    NotifierRequest,
    notifier_job_id,
    NotifierWorkerResult,
    NotifierWorkerError
);

/// The message reporting `result` to the orchestrator, if any.
///
/// The response carries the inbound `header` unchanged. Ignored runs produce
/// no response.
pub fn response_for<K: WorkerKind>(
    header: &MessageHeader,
    job_id: JobId,
    result: &RunResult,
) -> Option<Message<OrchestratorMessage>> {
    let payload = match result {
        RunResult::Success => K::result_message(WorkerResult::new(job_id, false)),
        RunResult::FinishedWithIssues => K::result_message(WorkerResult::new(job_id, true)),
        RunResult::Failed(cause) => K::error_message(WorkerError::new(job_id, cause.to_string())),
        RunResult::Ignored(_) => return None,
    };
    Some(Message::new(header.clone(), payload))
}
