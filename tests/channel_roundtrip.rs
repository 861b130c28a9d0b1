//! Coordinator and worker in one process over the channel transport.
//!
//! Run with: cargo test --test channel_roundtrip --features test-utils
//!
//! Both components are wired purely from configuration against the builtin
//! transport registry, the way a single-process deployment runs them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use scanbus::component::{start_component, ComponentContext, ComponentError, EndpointComponent};
use scanbus::config::ConfigManager;
use scanbus::endpoint::{Endpoint, ANALYZER, ORCHESTRATOR};
use scanbus::message::{
    AnalyzerRequest, Message, MessageHeader, OrchestratorMessage, WorkerResult,
};
use scanbus::transport::{EndpointHandlerResult, TransportRegistry, CHANNEL_TRANSPORT_NAME};
use scanbus::worker::kinds::Analyzer;
use scanbus::worker::testing::{MockJobRepository, MockResultRepository, ScriptedToolRunner};
use scanbus::worker::{Job, JobStatus, JobWorker, WorkerComponent, WorkerModules};

/// Forwards every orchestrator message to the test.
struct Coordinator {
    received: mpsc::UnboundedSender<Message<OrchestratorMessage>>,
}

#[async_trait]
impl EndpointComponent for Coordinator {
    type Payload = OrchestratorMessage;
    type Services = ();

    fn endpoint(&self) -> &'static Endpoint<OrchestratorMessage> {
        &ORCHESTRATOR
    }

    async fn custom_modules(&self, _context: &ComponentContext) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn handle(
        &self,
        _services: &(),
        _context: &ComponentContext,
        message: Message<OrchestratorMessage>,
    ) -> EndpointHandlerResult {
        let _ = self.received.send(message);
        EndpointHandlerResult::Continue
    }
}

struct AnalyzerModules {
    jobs: Arc<MockJobRepository>,
}

#[async_trait]
impl WorkerModules for AnalyzerModules {
    type Kind = Analyzer;
    type Runner = ScriptedToolRunner;

    async fn build(
        &self,
        _context: &ComponentContext,
    ) -> Result<JobWorker<ScriptedToolRunner>, ComponentError> {
        Ok(JobWorker::new(
            self.jobs.clone(),
            Arc::new(MockResultRepository::<serde_json::Value>::new()),
            ScriptedToolRunner::default(),
        ))
    }
}

fn pipeline_config() -> Arc<ConfigManager> {
    Arc::new(ConfigManager::from_map([
        ("orchestrator.sender.type", CHANNEL_TRANSPORT_NAME),
        ("orchestrator.receiver.type", CHANNEL_TRANSPORT_NAME),
        ("analyzer.sender.type", CHANNEL_TRANSPORT_NAME),
        ("analyzer.receiver.type", CHANNEL_TRANSPORT_NAME),
        ("analyzer.receiver.max_concurrency", "4"),
    ]))
}

#[tokio::test]
async fn test_job_request_roundtrip() {
    let config = pipeline_config();
    let registry = Arc::new(TransportRegistry::builtin().unwrap());

    let jobs = Arc::new(MockJobRepository::new());
    for job_id in 1..=3 {
        jobs.insert(Job::new(job_id, 5, JobStatus::Scheduled)).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = start_component(
        Coordinator { received: tx },
        config.clone(),
        registry.clone(),
    )
    .await
    .unwrap();
    let worker = start_component(
        WorkerComponent::new(AnalyzerModules { jobs: jobs.clone() }),
        config,
        registry,
    )
    .await
    .unwrap();

    let publisher = coordinator.context().publisher();
    for job_id in 1..=3 {
        let request = Message::new(
            MessageHeader::new(format!("trace-{}", job_id), Some(5)),
            AnalyzerRequest {
                analyzer_job_id: job_id,
            },
        );
        publisher.publish(&ANALYZER, request).await.unwrap();
    }

    let mut responses = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        responses.push(message);
    }
    responses.sort_by_key(|m| m.payload.job_id());

    for (job_id, response) in (1..=3).zip(&responses) {
        assert_eq!(response.header.trace_id, format!("trace-{}", job_id));
        assert_eq!(response.header.run_id, Some(5));
        assert_eq!(
            response.payload,
            OrchestratorMessage::AnalyzerWorkerResult(WorkerResult::new(job_id, false))
        );
        assert_eq!(jobs.status(job_id).await, Some(JobStatus::Running));
    }

    worker.stop().await.unwrap();
    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_receiver_on_endpoint_is_rejected() {
    let config = pipeline_config();
    let registry = Arc::new(TransportRegistry::builtin().unwrap());
    let (tx, _rx) = mpsc::unbounded_channel();

    let first = start_component(
        Coordinator { received: tx.clone() },
        config.clone(),
        registry.clone(),
    )
    .await
    .unwrap();

    let second = start_component(Coordinator { received: tx }, config, registry).await;
    assert!(matches!(second, Err(ComponentError::Transport(_))));

    first.stop().await.unwrap();
}
