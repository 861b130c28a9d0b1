//! Endpoint component running the job protocol for one worker kind.

use async_trait::async_trait;
use tracing::{error, info, Instrument};

use super::{response_for, JobWorker, RunResult, ToolRunner, WorkerKind};
use crate::component::{ComponentContext, ComponentError, EndpointComponent};
use crate::endpoint::{Endpoint, ORCHESTRATOR};
use crate::message::Message;
use crate::transport::EndpointHandlerResult;

/// Builds the worker-specific services of a [`WorkerComponent`].
#[async_trait]
pub trait WorkerModules: Send + Sync + 'static {
    type Kind: WorkerKind;
    type Runner: ToolRunner;

    async fn build(
        &self,
        context: &ComponentContext,
    ) -> Result<JobWorker<Self::Runner>, ComponentError>;
}

/// A worker process: receives job requests for `M::Kind`, runs them and
/// reports the outcome to the orchestrator.
pub struct WorkerComponent<M> {
    modules: M,
}

impl<M: WorkerModules> WorkerComponent<M> {
    pub fn new(modules: M) -> Self {
        Self { modules }
    }
}

type RequestOf<M> = <<M as WorkerModules>::Kind as WorkerKind>::Request;

#[async_trait]
impl<M: WorkerModules> EndpointComponent for WorkerComponent<M> {
    type Payload = RequestOf<M>;
    type Services = JobWorker<M::Runner>;

    fn endpoint(&self) -> &'static Endpoint<RequestOf<M>> {
        <M::Kind as WorkerKind>::endpoint()
    }

    async fn custom_modules(
        &self,
        context: &ComponentContext,
    ) -> Result<JobWorker<M::Runner>, ComponentError> {
        self.modules.build(context).await
    }

    async fn handle(
        &self,
        worker: &JobWorker<M::Runner>,
        context: &ComponentContext,
        message: Message<RequestOf<M>>,
    ) -> EndpointHandlerResult {
        let job_id = <M::Kind as WorkerKind>::job_id(&message.payload);
        let span = tracing::info_span!(
            "job",
            worker = <M::Kind as WorkerKind>::endpoint().name(),
            job_id,
            trace_id = %message.header.trace_id,
            run_id = ?message.header.run_id
        );

        async {
            let result = worker.run(job_id).await;
            match &result {
                RunResult::Success => info!("Job finished"),
                RunResult::FinishedWithIssues => info!("Job finished with issues"),
                RunResult::Failed(cause) => error!(error = %cause, "Job failed"),
                RunResult::Ignored(reason) => info!(reason = %reason, "Job ignored"),
            }

            if let Some(response) =
                response_for::<M::Kind>(&message.header, job_id, &result)
            {
                if let Err(e) = context.publisher().publish(&ORCHESTRATOR, response).await {
                    error!(error = %e, "Failed to report job outcome");
                }
            }
        }
        .instrument(span)
        .await;

        EndpointHandlerResult::Continue
    }
}
