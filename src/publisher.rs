//! Message publisher.
//!
//! The single entry point application code uses to send messages. Senders are
//! resolved through the [`TransportRegistry`] on first use of an endpoint and
//! cached for the lifetime of the publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::ConfigManager;
use crate::endpoint::Endpoint;
use crate::message::{Message, Payload};
use crate::transport::{MessageSender, PublishError, TransportRegistry};

type SenderCell = Arc<OnceCell<Arc<dyn MessageSender>>>;

/// Resolves, caches and uses one sender per destination endpoint.
pub struct MessagePublisher {
    registry: Arc<TransportRegistry>,
    config: Arc<ConfigManager>,
    senders: Mutex<HashMap<&'static str, SenderCell>>,
}

impl MessagePublisher {
    pub fn new(registry: Arc<TransportRegistry>, config: Arc<ConfigManager>) -> Self {
        Self {
            registry,
            config,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Send `message` to `endpoint`.
    ///
    /// Concurrent first use of an endpoint builds exactly one sender. A failed
    /// resolution is returned and retried on the next call.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(endpoint = %endpoint, trace_id = %message.header.trace_id))]
    pub async fn publish<T: Payload>(
        &self,
        endpoint: &Endpoint<T>,
        message: Message<T>,
    ) -> Result<(), PublishError> {
        let raw = message.encode()?;
        let sender = self.sender_for(endpoint).await?;
        sender.send(raw).await?;
        debug!("Message published");
        Ok(())
    }

    async fn sender_for<T>(
        &self,
        endpoint: &Endpoint<T>,
    ) -> Result<Arc<dyn MessageSender>, PublishError> {
        let cell = {
            let mut senders = self
                .senders
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            senders.entry(endpoint.name()).or_default().clone()
        };

        let sender = cell
            .get_or_try_init(|| self.registry.create_sender(endpoint.descriptor(), &self.config))
            .await?;
        Ok(sender.clone())
    }
}
