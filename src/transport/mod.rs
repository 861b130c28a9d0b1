//! Transport service-provider interface.
//!
//! This module contains:
//! - `MessageSender` / `MessageSenderFactory`: outbound delivery per endpoint
//! - `MessageHandler` / `MessageReceiverFactory`: inbound delivery per endpoint
//! - `TransportRegistry`: the table of factories keyed by transport type name
//! - Implementations: in-process channel, testing, AMQP (RabbitMQ)
//!
//! Which factory serves an endpoint is decided purely by configuration: the
//! `type` key of the `<endpoint>.sender` or `<endpoint>.receiver` section.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{parse_value, ConfigError, ConfigManager};
use crate::endpoint::EndpointDescriptor;
use crate::message::RawMessage;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpReceiverFactory, AmqpSenderFactory, AMQP_TRANSPORT_NAME};
#[cfg(feature = "channel")]
pub use channel::{ChannelTransport, CHANNEL_TRANSPORT_NAME};
#[cfg(any(test, feature = "test-utils"))]
pub use testing::{TestingTransport, TEST_TRANSPORT_NAME};

/// Configuration key naming the transport of a section.
pub const TYPE_KEY: &str = "type";

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while resolving or using a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No {direction} transport named '{type_name}' is registered (configured in '{endpoint}.{direction}.type')")]
    UnknownTransport {
        type_name: String,
        endpoint: String,
        direction: Direction,
    },

    #[error("Missing configuration key '{endpoint}.{direction}.type'")]
    MissingTransportType { endpoint: String, direction: Direction },

    #[error("A {direction} factory for transport '{type_name}' is already registered")]
    DuplicateFactory {
        type_name: String,
        direction: Direction,
    },

    #[error("A receiver for endpoint '{0}' is already installed")]
    ReceiverAlreadyInstalled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Errors surfaced by `MessagePublisher::publish`.
pub type PublishError = TransportError;

// ============================================================================
// Configuration
// ============================================================================

/// Which side of an endpoint a transport serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sender,
    Receiver,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Sender, Direction::Receiver];

    /// Name of the configuration section for this direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sender => "sender",
            Direction::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved `<endpoint>.<direction>` section handed to a factory.
///
/// Properties are passed through verbatim, including the `type` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    endpoint: &'static str,
    direction: Direction,
    properties: BTreeMap<String, String>,
}

impl TransportConfig {
    pub fn new(
        endpoint: &'static EndpointDescriptor,
        direction: Direction,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            endpoint: endpoint.name(),
            direction,
            properties,
        }
    }

    /// Read the section for `endpoint` and `direction` from the configuration.
    pub fn resolve(
        endpoint: &'static EndpointDescriptor,
        direction: Direction,
        config: &ConfigManager,
    ) -> Result<Self> {
        let section = format!("{}.{}", endpoint.config_prefix(), direction);
        let properties = config.subsection(&section);

        match properties.get(TYPE_KEY) {
            Some(type_name) if !type_name.trim().is_empty() => {
                Ok(Self::new(endpoint, direction, properties))
            }
            _ => Err(TransportError::MissingTransportType {
                endpoint: endpoint.name().to_string(),
                direction,
            }),
        }
    }

    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Full configuration path of this section, e.g. `analyzer.sender`.
    pub fn section(&self) -> String {
        format!("{}.{}", self.endpoint, self.direction)
    }

    /// The configured transport type name.
    pub fn transport_type(&self) -> &str {
        self.properties
            .get(TYPE_KEY)
            .map(|t| t.trim())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Look up a property, failing with its full configuration path.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            ConfigError::Missing {
                key: format!("{}.{}", self.section(), key),
            }
            .into()
        })
    }

    /// Parse a property, falling back to `default` when it is absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => Ok(parse_value(&format!("{}.{}", self.section(), key), raw)?),
            None => Ok(default),
        }
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Outbound delivery for one endpoint.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Hand a message to the transport.
    async fn send(&self, message: RawMessage) -> Result<()>;
}

/// Builds senders for one transport type.
#[async_trait]
pub trait MessageSenderFactory: Send + Sync {
    /// The transport type name this factory serves.
    fn name(&self) -> &str;

    async fn create_sender(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &TransportConfig,
    ) -> Result<Arc<dyn MessageSender>>;
}

/// What a receive loop does after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHandlerResult {
    /// Keep receiving.
    Continue,
    /// End the receive loop. Used by tests to stop deterministically.
    Stop,
}

/// Handler invoked by a receive loop for every inbound message.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: RawMessage) -> BoxFuture<'static, EndpointHandlerResult>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(RawMessage) -> Fut + Send + Sync,
    Fut: Future<Output = EndpointHandlerResult> + Send + 'static,
{
    fn handle(&self, message: RawMessage) -> BoxFuture<'static, EndpointHandlerResult> {
        Box::pin(self(message))
    }
}

/// Installs receive loops for one transport type.
#[async_trait]
pub trait MessageReceiverFactory: Send + Sync {
    /// The transport type name this factory serves.
    fn name(&self) -> &str;

    async fn create_receiver(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &TransportConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ReceiverHandle>;
}

// ============================================================================
// Receiver handle
// ============================================================================

type InstalledSet = Arc<Mutex<HashSet<&'static str>>>;

/// Owns a running receive loop.
///
/// Dropping the handle signals the loop to shut down without waiting for it.
pub struct ReceiverHandle {
    endpoint: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    installed: Option<InstalledSet>,
}

impl ReceiverHandle {
    /// Spawn a receive loop. The loop must return once the shutdown signal
    /// resolves.
    pub fn spawn<F, Fut>(endpoint: &'static EndpointDescriptor, run: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(shutdown_rx));
        Self {
            endpoint: endpoint.name(),
            shutdown: Some(shutdown),
            task: Some(task),
            installed: None,
        }
    }

    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    /// Whether the receive loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request shutdown and wait for the receive loop to end.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join().await
    }

    /// Wait for a receive loop that ends on its own.
    pub async fn finished(&mut self) -> Result<()> {
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let result = match self.task.as_mut() {
            Some(task) => task.await,
            None => return Ok(()),
        };
        self.task = None;
        self.release();
        result.map_err(|e| {
            TransportError::Receive(format!("receive loop for '{}' failed: {}", self.endpoint, e))
        })
    }

    fn track(mut self, installed: InstalledSet) -> Self {
        self.installed = Some(installed);
        self
    }

    fn release(&mut self) {
        if let Some(installed) = self.installed.take() {
            lock(&installed).remove(self.endpoint);
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.release();
    }
}

impl fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverHandle")
            .field("endpoint", &self.endpoint)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Registry
// ============================================================================

/// A transport backend contributed from outside this crate.
///
/// Submit one with `inventory::submit!` and it is picked up by
/// [`TransportRegistry::builtin`].
pub struct TransportPlugin {
    pub sender: Option<fn() -> Arc<dyn MessageSenderFactory>>,
    pub receiver: Option<fn() -> Arc<dyn MessageReceiverFactory>>,
}

inventory::collect!(TransportPlugin);

/// Factories available to this process, keyed by transport type name.
#[derive(Default)]
pub struct TransportRegistry {
    senders: HashMap<String, Arc<dyn MessageSenderFactory>>,
    receivers: HashMap<String, Arc<dyn MessageReceiverFactory>>,
    installed: InstalledSet,
}

impl TransportRegistry {
    /// Create a registry without any factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every backend compiled into this binary plus all
    /// submitted [`TransportPlugin`]s.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();

        #[cfg(feature = "channel")]
        {
            registry = registry.with_transport(Arc::new(ChannelTransport::new()))?;
        }

        #[cfg(feature = "amqp")]
        {
            registry = registry
                .with_sender_factory(Arc::new(AmqpSenderFactory::new()))?
                .with_receiver_factory(Arc::new(AmqpReceiverFactory::new()))?;
        }

        for plugin in inventory::iter::<TransportPlugin> {
            if let Some(sender) = plugin.sender {
                registry = registry.with_sender_factory(sender())?;
            }
            if let Some(receiver) = plugin.receiver {
                registry = registry.with_receiver_factory(receiver())?;
            }
        }

        info!(
            senders = ?registry.sender_types(),
            receivers = ?registry.receiver_types(),
            "Transport registry initialized"
        );

        Ok(registry)
    }

    pub fn with_sender_factory(mut self, factory: Arc<dyn MessageSenderFactory>) -> Result<Self> {
        let name = factory.name().to_string();
        if self.senders.contains_key(&name) {
            return Err(TransportError::DuplicateFactory {
                type_name: name,
                direction: Direction::Sender,
            });
        }
        self.senders.insert(name, factory);
        Ok(self)
    }

    pub fn with_receiver_factory(
        mut self,
        factory: Arc<dyn MessageReceiverFactory>,
    ) -> Result<Self> {
        let name = factory.name().to_string();
        if self.receivers.contains_key(&name) {
            return Err(TransportError::DuplicateFactory {
                type_name: name,
                direction: Direction::Receiver,
            });
        }
        self.receivers.insert(name, factory);
        Ok(self)
    }

    /// Register a backend serving both directions.
    pub fn with_transport<T>(self, transport: Arc<T>) -> Result<Self>
    where
        T: MessageSenderFactory + MessageReceiverFactory + 'static,
    {
        self.with_sender_factory(transport.clone())?
            .with_receiver_factory(transport)
    }

    /// Registered sender transport names, sorted.
    pub fn sender_types(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.senders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered receiver transport names, sorted.
    pub fn receiver_types(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.receivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Find the sender factory configured for `endpoint` without creating
    /// anything.
    pub fn resolve_sender_factory(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &ConfigManager,
    ) -> Result<(Arc<dyn MessageSenderFactory>, TransportConfig)> {
        let transport_config = TransportConfig::resolve(endpoint, Direction::Sender, config)?;
        let factory = self
            .senders
            .get(transport_config.transport_type())
            .cloned()
            .ok_or_else(|| unknown(&transport_config))?;
        Ok((factory, transport_config))
    }

    /// Find the receiver factory configured for `endpoint` without installing
    /// anything.
    pub fn resolve_receiver_factory(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &ConfigManager,
    ) -> Result<(Arc<dyn MessageReceiverFactory>, TransportConfig)> {
        let transport_config = TransportConfig::resolve(endpoint, Direction::Receiver, config)?;
        let factory = self
            .receivers
            .get(transport_config.transport_type())
            .cloned()
            .ok_or_else(|| unknown(&transport_config))?;
        Ok((factory, transport_config))
    }

    /// Create a sender for `endpoint` using its configured transport.
    pub async fn create_sender(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &ConfigManager,
    ) -> Result<Arc<dyn MessageSender>> {
        let (factory, transport_config) = self.resolve_sender_factory(endpoint, config)?;
        debug!(
            endpoint = %endpoint,
            transport = transport_config.transport_type(),
            "Creating sender"
        );
        factory.create_sender(endpoint, &transport_config).await
    }

    /// Install the receive loop for `endpoint` using its configured transport.
    ///
    /// At most one receiver per endpoint may be installed through a registry
    /// at a time.
    pub async fn install_receiver(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &ConfigManager,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ReceiverHandle> {
        let (factory, transport_config) = self.resolve_receiver_factory(endpoint, config)?;

        if !lock(&self.installed).insert(endpoint.name()) {
            return Err(TransportError::ReceiverAlreadyInstalled(
                endpoint.name().to_string(),
            ));
        }

        match factory
            .create_receiver(endpoint, &transport_config, handler)
            .await
        {
            Ok(handle) => {
                info!(
                    endpoint = %endpoint,
                    transport = transport_config.transport_type(),
                    "Receiver installed"
                );
                Ok(handle.track(self.installed.clone()))
            }
            Err(e) => {
                lock(&self.installed).remove(endpoint.name());
                Err(e)
            }
        }
    }
}

fn unknown(config: &TransportConfig) -> TransportError {
    TransportError::UnknownTransport {
        type_name: config.transport_type().to_string(),
        endpoint: config.endpoint().to_string(),
        direction: config.direction(),
    }
}
