//! In-process channel transport.
//!
//! Uses one bounded tokio mpsc queue per endpoint. Senders and receivers built
//! by the same [`ChannelTransport`] share those queues, which makes it a
//! complete broker for pipelines running inside a single process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, error, info, Instrument};

use super::{
    EndpointHandlerResult, MessageHandler, MessageReceiverFactory, MessageSender,
    MessageSenderFactory, ReceiverHandle, Result, TransportConfig, TransportError,
};
use crate::endpoint::EndpointDescriptor;
use crate::message::RawMessage;

/// Transport type name of the channel transport.
pub const CHANNEL_TRANSPORT_NAME: &str = "channel";

/// Queue capacity per endpoint.
const CHANNEL_CAPACITY: usize = 1024;

/// Receiver property bounding concurrent handler invocations.
pub const MAX_CONCURRENCY_KEY: &str = "max_concurrency";

struct Queue {
    sender: mpsc::Sender<RawMessage>,
    receiver: Arc<Mutex<mpsc::Receiver<RawMessage>>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

/// In-memory broker serving both directions.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    queues: Arc<Mutex<HashMap<&'static str, Queue>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, endpoint: &'static str) -> mpsc::Sender<RawMessage> {
        self.queues
            .lock()
            .await
            .entry(endpoint)
            .or_insert_with(Queue::new)
            .sender
            .clone()
    }

    async fn receiver_for(&self, endpoint: &'static str) -> Arc<Mutex<mpsc::Receiver<RawMessage>>> {
        self.queues
            .lock()
            .await
            .entry(endpoint)
            .or_insert_with(Queue::new)
            .receiver
            .clone()
    }
}

struct ChannelSender {
    endpoint: &'static str,
    sender: mpsc::Sender<RawMessage>,
}

#[async_trait]
impl MessageSender for ChannelSender {
    #[tracing::instrument(name = "channel.send", skip_all, fields(endpoint = %self.endpoint, trace_id = %message.header.trace_id))]
    async fn send(&self, message: RawMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| TransportError::Send(format!("queue for '{}' is closed", self.endpoint)))?;
        debug!("Message queued");
        Ok(())
    }
}

#[async_trait]
impl MessageSenderFactory for ChannelTransport {
    fn name(&self) -> &str {
        CHANNEL_TRANSPORT_NAME
    }

    async fn create_sender(
        &self,
        endpoint: &'static EndpointDescriptor,
        _config: &TransportConfig,
    ) -> Result<Arc<dyn MessageSender>> {
        Ok(Arc::new(ChannelSender {
            endpoint: endpoint.name(),
            sender: self.sender_for(endpoint.name()).await,
        }))
    }
}

#[async_trait]
impl MessageReceiverFactory for ChannelTransport {
    fn name(&self) -> &str {
        CHANNEL_TRANSPORT_NAME
    }

    async fn create_receiver(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &TransportConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ReceiverHandle> {
        let max_concurrency = config.parse_or(MAX_CONCURRENCY_KEY, 1usize)?.max(1);
        let receiver = self.receiver_for(endpoint.name()).await;

        info!(
            endpoint = %endpoint,
            max_concurrency,
            "Channel receiver started"
        );

        Ok(ReceiverHandle::spawn(endpoint, move |shutdown| {
            receive_loop(endpoint, receiver, handler, max_concurrency, shutdown)
        }))
    }
}

async fn receive_loop(
    endpoint: &'static EndpointDescriptor,
    receiver: Arc<Mutex<mpsc::Receiver<RawMessage>>>,
    handler: Arc<dyn MessageHandler>,
    max_concurrency: usize,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    // Held for the lifetime of the loop; a later receiver takes over the queue
    // once this one is gone.
    let mut queue = receiver.lock().await;
    let permits = Arc::new(Semaphore::new(max_concurrency));
    let (stop_tx, mut stop_rx) = watch::channel(false);

    loop {
        // A message leaves the queue only once a handler slot is held.
        let permit = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = stop_rx.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let message = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = stop_rx.changed() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => {
                    info!(endpoint = %endpoint, "Channel closed, stopping receiver");
                    break;
                }
            },
        };

        let handler = handler.clone();
        let stop_tx = stop_tx.clone();
        let span = tracing::info_span!(
            "channel.receive",
            endpoint = %endpoint,
            trace_id = %message.header.trace_id
        );
        tokio::spawn(
            async move {
                if handler.handle(message).await == EndpointHandlerResult::Stop {
                    let _ = stop_tx.send(true);
                }
                drop(permit);
            }
            .instrument(span),
        );
    }

    // Let in-flight handlers finish before reporting the loop as ended.
    let in_flight = u32::try_from(max_concurrency).unwrap_or(u32::MAX);
    if permits.acquire_many(in_flight).await.is_err() {
        error!(endpoint = %endpoint, "Failed to drain channel receiver");
    }
    info!(endpoint = %endpoint, "Channel receiver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;
    use crate::endpoint::{ANALYZER, SCANNER};
    use crate::message::{AnalyzerRequest, Message, MessageHeader};
    use crate::transport::{Direction, TransportRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn request(job_id: i64) -> RawMessage {
        Message::new(
            MessageHeader::new(format!("trace-{}", job_id), Some(1)),
            AnalyzerRequest {
                analyzer_job_id: job_id,
            },
        )
        .encode()
        .unwrap()
    }

    fn receiver_config(max_concurrency: usize) -> TransportConfig {
        TransportConfig::resolve(
            ANALYZER.descriptor(),
            Direction::Receiver,
            &ConfigManager::from_map([
                ("analyzer.receiver.type", CHANNEL_TRANSPORT_NAME.to_string()),
                ("analyzer.receiver.max_concurrency", max_concurrency.to_string()),
            ]),
        )
        .unwrap()
    }

    fn sender_config() -> TransportConfig {
        TransportConfig::resolve(
            ANALYZER.descriptor(),
            Direction::Sender,
            &ConfigManager::from_map([("analyzer.sender.type", CHANNEL_TRANSPORT_NAME)]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_before_receiver_is_buffered() {
        let transport = ChannelTransport::new();
        let sender = transport
            .create_sender(ANALYZER.descriptor(), &sender_config())
            .await
            .unwrap();
        sender.send(request(1)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |message: RawMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message).await;
                EndpointHandlerResult::Continue
            }
        });
        let handle = transport
            .create_receiver(ANALYZER.descriptor(), &receiver_config(1), handler)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.header.trace_id, "trace-1");

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_result_ends_loop() {
        let transport = ChannelTransport::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_message: RawMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { EndpointHandlerResult::Stop }
        });

        let mut handle = transport
            .create_receiver(ANALYZER.descriptor(), &receiver_config(1), handler)
            .await
            .unwrap();
        let sender = transport
            .create_sender(ANALYZER.descriptor(), &sender_config())
            .await
            .unwrap();
        sender.send(request(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle.finished())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_messages_behind_stop_stay_queued() {
        let transport = ChannelTransport::new();
        let stopping: Arc<dyn MessageHandler> = Arc::new(|_message: RawMessage| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            EndpointHandlerResult::Stop
        });

        let mut first = transport
            .create_receiver(ANALYZER.descriptor(), &receiver_config(1), stopping)
            .await
            .unwrap();
        let sender = transport
            .create_sender(ANALYZER.descriptor(), &sender_config())
            .await
            .unwrap();
        sender.send(request(1)).await.unwrap();
        sender.send(request(2)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), first.finished())
            .await
            .unwrap()
            .unwrap();
        drop(first);

        let (tx, mut rx) = mpsc::channel(4);
        let forwarding: Arc<dyn MessageHandler> = Arc::new(move |message: RawMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message).await;
                EndpointHandlerResult::Continue
            }
        });
        let second = transport
            .create_receiver(ANALYZER.descriptor(), &receiver_config(1), forwarding)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.header.trace_id, "trace-2");

        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_unclaimed_messages_queued() {
        let transport = ChannelTransport::new();
        let (release_tx, release_rx) = watch::channel(false);
        let blocking: Arc<dyn MessageHandler> = Arc::new(move |_message: RawMessage| {
            let mut release = release_rx.clone();
            async move {
                let _ = release.wait_for(|released| *released).await;
                EndpointHandlerResult::Continue
            }
        });

        let first = transport
            .create_receiver(ANALYZER.descriptor(), &receiver_config(1), blocking)
            .await
            .unwrap();
        let sender = transport
            .create_sender(ANALYZER.descriptor(), &sender_config())
            .await
            .unwrap();
        sender.send(request(1)).await.unwrap();
        sender.send(request(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping = tokio::spawn(first.stop());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = release_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), stopping)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let forwarding: Arc<dyn MessageHandler> = Arc::new(move |message: RawMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message).await;
                EndpointHandlerResult::Continue
            }
        });
        let second = transport
            .create_receiver(ANALYZER.descriptor(), &receiver_config(1), forwarding)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.header.trace_id, "trace-2");

        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_concurrency_bounds_handlers() {
        let transport = ChannelTransport::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let (active_c, peak_c, done_c) = (active.clone(), peak.clone(), done.clone());
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_message: RawMessage| {
            let (active, peak, done) = (active_c.clone(), peak_c.clone(), done_c.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                EndpointHandlerResult::Continue
            }
        });

        let handle = transport
            .create_receiver(ANALYZER.descriptor(), &receiver_config(2), handler)
            .await
            .unwrap();
        let sender = transport
            .create_sender(ANALYZER.descriptor(), &sender_config())
            .await
            .unwrap();
        for job in 0..6 {
            sender.send(request(job)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while done.load(Ordering::SeqCst) < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_routes_between_endpoints() {
        let registry = TransportRegistry::new()
            .with_transport(Arc::new(ChannelTransport::new()))
            .unwrap();
        let config = ConfigManager::from_map([
            ("scanner.sender.type", CHANNEL_TRANSPORT_NAME),
            ("scanner.receiver.type", CHANNEL_TRANSPORT_NAME),
        ]);

        let (tx, mut rx) = mpsc::channel(1);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |message: RawMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message).await;
                EndpointHandlerResult::Continue
            }
        });
        let handle = registry
            .install_receiver(SCANNER.descriptor(), &config, handler)
            .await
            .unwrap();

        let sender = registry
            .create_sender(SCANNER.descriptor(), &config)
            .await
            .unwrap();
        sender.send(request(5)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.header.trace_id, "trace-5");
        handle.stop().await.unwrap();
    }
}
