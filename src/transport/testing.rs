//! Transport for tests.
//!
//! Senders record every message per endpoint instead of delivering it, and
//! inbound messages are injected by the test itself through
//! [`TestingTransport::receive`], which awaits the installed handler directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};

use super::{
    EndpointHandlerResult, MessageHandler, MessageReceiverFactory, MessageSender,
    MessageSenderFactory, ReceiverHandle, Result, TransportConfig, TransportError,
};
use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::message::{Message, Payload, RawMessage};

/// Transport type name of the testing transport.
pub const TEST_TRANSPORT_NAME: &str = "testTransport";

/// How long `expect_message` waits by default.
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `expect_no_message` watches for stray messages.
const NO_MESSAGE_WINDOW: Duration = Duration::from_millis(100);

struct InstalledReceiver {
    handler: Arc<dyn MessageHandler>,
    stopped: Arc<Notify>,
}

#[derive(Default)]
struct State {
    sent: Mutex<HashMap<&'static str, VecDeque<RawMessage>>>,
    sent_notify: Notify,
    sender_creations: Mutex<HashMap<&'static str, usize>>,
    sender_configs: Mutex<HashMap<&'static str, TransportConfig>>,
    receivers: Mutex<HashMap<&'static str, InstalledReceiver>>,
    fail_on_send: RwLock<bool>,
}

/// In-memory transport serving both directions.
///
/// Clones share state, so a test can keep one clone while another is
/// registered with a [`super::TransportRegistry`].
#[derive(Clone, Default)]
pub struct TestingTransport {
    state: Arc<State>,
}

impl TestingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        *self.state.fail_on_send.write().await = fail;
    }

    /// Deliver a message to the receiver installed for `endpoint`.
    pub async fn receive<T: Payload>(
        &self,
        endpoint: &Endpoint<T>,
        message: Message<T>,
    ) -> Result<EndpointHandlerResult> {
        self.receive_raw(endpoint.descriptor(), message.encode()?)
            .await
    }

    /// Deliver an already encoded message, bypassing payload typing.
    pub async fn receive_raw(
        &self,
        endpoint: &EndpointDescriptor,
        message: RawMessage,
    ) -> Result<EndpointHandlerResult> {
        let (handler, stopped) = {
            let receivers = self.state.receivers.lock().await;
            let installed = receivers.get(endpoint.name()).ok_or_else(|| {
                TransportError::Receive(format!("no receiver installed for '{}'", endpoint))
            })?;
            (installed.handler.clone(), installed.stopped.clone())
        };

        let result = handler.handle(message).await;
        if result == EndpointHandlerResult::Stop {
            stopped.notify_one();
        }
        Ok(result)
    }

    /// Wait for the next message sent to `endpoint`.
    pub async fn expect_message<T: Payload>(&self, endpoint: &Endpoint<T>) -> Result<Message<T>> {
        self.expect_message_within(endpoint, DEFAULT_EXPECT_TIMEOUT)
            .await
    }

    pub async fn expect_message_within<T: Payload>(
        &self,
        endpoint: &Endpoint<T>,
        timeout: Duration,
    ) -> Result<Message<T>> {
        let raw = tokio::time::timeout(timeout, self.next_sent(endpoint.name()))
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "no message sent to '{}' within {:?}",
                    endpoint, timeout
                ))
            })?;
        Ok(raw.decode()?)
    }

    /// Fail if any message was, or shortly is, sent to `endpoint`.
    pub async fn expect_no_message<T: Payload>(&self, endpoint: &Endpoint<T>) -> Result<()> {
        match tokio::time::timeout(NO_MESSAGE_WINDOW, self.next_sent(endpoint.name())).await {
            Ok(message) => Err(TransportError::UnexpectedMessage(format!(
                "'{}' received {:?}",
                endpoint, message
            ))),
            Err(_) => Ok(()),
        }
    }

    /// Messages sent to `endpoint` that were not yet taken by an expectation.
    pub async fn pending_count(&self, endpoint: &EndpointDescriptor) -> usize {
        self.state
            .sent
            .lock()
            .await
            .get(endpoint.name())
            .map_or(0, VecDeque::len)
    }

    /// How many senders were created for `endpoint`.
    pub async fn sender_creations(&self, endpoint: &EndpointDescriptor) -> usize {
        self.state
            .sender_creations
            .lock()
            .await
            .get(endpoint.name())
            .copied()
            .unwrap_or(0)
    }

    /// The configuration the most recent sender for `endpoint` was built from.
    pub async fn sender_config(&self, endpoint: &EndpointDescriptor) -> Option<TransportConfig> {
        self.state
            .sender_configs
            .lock()
            .await
            .get(endpoint.name())
            .cloned()
    }

    pub async fn has_receiver(&self, endpoint: &EndpointDescriptor) -> bool {
        self.state
            .receivers
            .lock()
            .await
            .contains_key(endpoint.name())
    }

    async fn next_sent(&self, endpoint: &'static str) -> RawMessage {
        loop {
            let notified = self.state.sent_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self
                .state
                .sent
                .lock()
                .await
                .get_mut(endpoint)
                .and_then(VecDeque::pop_front)
            {
                return message;
            }

            notified.await;
        }
    }
}

struct TestingSender {
    endpoint: &'static str,
    state: Arc<State>,
}

#[async_trait]
impl MessageSender for TestingSender {
    async fn send(&self, message: RawMessage) -> Result<()> {
        if *self.state.fail_on_send.read().await {
            return Err(TransportError::Send("Testing send failure".to_string()));
        }
        self.state
            .sent
            .lock()
            .await
            .entry(self.endpoint)
            .or_default()
            .push_back(message);
        self.state.sent_notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl MessageSenderFactory for TestingTransport {
    fn name(&self) -> &str {
        TEST_TRANSPORT_NAME
    }

    async fn create_sender(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &TransportConfig,
    ) -> Result<Arc<dyn MessageSender>> {
        *self
            .state
            .sender_creations
            .lock()
            .await
            .entry(endpoint.name())
            .or_default() += 1;
        self.state
            .sender_configs
            .lock()
            .await
            .insert(endpoint.name(), config.clone());

        Ok(Arc::new(TestingSender {
            endpoint: endpoint.name(),
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl MessageReceiverFactory for TestingTransport {
    fn name(&self) -> &str {
        TEST_TRANSPORT_NAME
    }

    async fn create_receiver(
        &self,
        endpoint: &'static EndpointDescriptor,
        _config: &TransportConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ReceiverHandle> {
        let stopped = Arc::new(Notify::new());
        self.state.receivers.lock().await.insert(
            endpoint.name(),
            InstalledReceiver {
                handler,
                stopped: stopped.clone(),
            },
        );

        let state = self.state.clone();
        Ok(ReceiverHandle::spawn(endpoint, move |shutdown| async move {
            tokio::select! {
                _ = shutdown => {}
                _ = stopped.notified() => {}
            }
            state.receivers.lock().await.remove(endpoint.name());
        }))
    }
}
