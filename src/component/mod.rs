//! Endpoint component lifecycle.
//!
//! Every process, coordinator or worker, is one [`EndpointComponent`]: it
//! owns one endpoint, builds its services once at startup, and handles every
//! message arriving on that endpoint with a single handler.
//!
//! Startup errors (configuration, unknown transports, service construction)
//! are returned from [`start_component`] and are meant to end the process.
//! Nothing raised while handling a message escapes the handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ConfigManager};
use crate::endpoint::Endpoint;
use crate::message::{Message, Payload, RawMessage};
use crate::publisher::MessagePublisher;
use crate::transport::{
    EndpointHandlerResult, MessageHandler, ReceiverHandle, TransportError, TransportRegistry,
};
use crate::utils::bootstrap::init_tracing;

/// Errors that prevent a component from starting or shutting down cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to build services for endpoint '{endpoint}': {source}")]
    Services {
        endpoint: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

impl ComponentError {
    pub fn services<T>(
        endpoint: &Endpoint<T>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Services {
            endpoint: endpoint.name().to_string(),
            source: source.into(),
        }
    }
}

/// Services every component receives.
#[derive(Clone)]
pub struct ComponentContext {
    config: Arc<ConfigManager>,
    publisher: Arc<MessagePublisher>,
}

impl ComponentContext {
    pub fn new(config: Arc<ConfigManager>, registry: Arc<TransportRegistry>) -> Self {
        let publisher = Arc::new(MessagePublisher::new(registry, config.clone()));
        Self { config, publisher }
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn publisher(&self) -> &Arc<MessagePublisher> {
        &self.publisher
    }
}

/// A process bound to one endpoint.
#[async_trait]
pub trait EndpointComponent: Send + Sync + 'static {
    /// What arrives on the endpoint.
    type Payload: Payload;
    /// Component-specific services, built once at startup.
    type Services: Send + Sync + 'static;

    /// The endpoint this component receives on.
    fn endpoint(&self) -> &'static Endpoint<Self::Payload>;

    /// Build the component-specific services.
    async fn custom_modules(
        &self,
        context: &ComponentContext,
    ) -> Result<Self::Services, ComponentError>;

    /// Handle one inbound message.
    ///
    /// May publish any number of messages. Must not panic in normal
    /// operation; a panic is logged as a bug and the message is dropped.
    async fn handle(
        &self,
        services: &Self::Services,
        context: &ComponentContext,
        message: Message<Self::Payload>,
    ) -> EndpointHandlerResult;
}

/// Decodes raw messages for a component and shields the receive loop from
/// handler panics.
struct ComponentHandler<C: EndpointComponent> {
    component: Arc<C>,
    services: Arc<C::Services>,
    context: ComponentContext,
}

impl<C: EndpointComponent> MessageHandler for ComponentHandler<C> {
    fn handle(&self, message: RawMessage) -> BoxFuture<'static, EndpointHandlerResult> {
        let component = self.component.clone();
        let services = self.services.clone();
        let context = self.context.clone();

        Box::pin(async move {
            let endpoint = component.endpoint();
            let trace_id = message.header.trace_id.clone();

            let message = match message.decode::<C::Payload>() {
                Ok(message) => message,
                Err(e) => {
                    error!(
                        endpoint = %endpoint,
                        trace_id = %trace_id,
                        error = %e,
                        "Undecodable payload, skipping message"
                    );
                    return EndpointHandlerResult::Continue;
                }
            };

            let handled = AssertUnwindSafe(component.handle(&services, &context, message))
                .catch_unwind()
                .await;

            match handled {
                Ok(result) => result,
                Err(panic) => {
                    error!(
                        endpoint = %endpoint,
                        trace_id = %trace_id,
                        panic = %panic_message(panic.as_ref()),
                        "Endpoint handler panicked"
                    );
                    EndpointHandlerResult::Continue
                }
            }
        })
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A started component.
///
/// Dropping it uninstalls the receiver without waiting for in-flight
/// messages; prefer [`RunningComponent::stop`].
pub struct RunningComponent<C: EndpointComponent> {
    endpoint: &'static Endpoint<C::Payload>,
    receiver: ReceiverHandle,
    services: Arc<C::Services>,
    context: ComponentContext,
}

impl<C: EndpointComponent> RunningComponent<C> {
    pub fn endpoint(&self) -> &'static Endpoint<C::Payload> {
        self.endpoint
    }

    pub fn context(&self) -> &ComponentContext {
        &self.context
    }

    pub fn services(&self) -> &Arc<C::Services> {
        &self.services
    }

    /// Uninstall the receiver and wait for its loop to end.
    pub async fn stop(self) -> Result<(), ComponentError> {
        self.receiver.stop().await?;
        info!(endpoint = %self.endpoint, "Endpoint component stopped");
        Ok(())
    }

    /// Wait until the receive loop ends on its own.
    pub async fn finished(&mut self) -> Result<(), ComponentError> {
        self.receiver.finished().await?;
        Ok(())
    }

    /// Park until a shutdown signal arrives or the receive loop ends, then
    /// tear the component down.
    pub async fn run_until_shutdown(mut self) -> Result<(), ComponentError> {
        info!(endpoint = %self.endpoint, "Endpoint component running, press Ctrl+C to exit");

        enum Outcome {
            Signal(std::io::Result<()>),
            Finished(Result<(), TransportError>),
        }

        let outcome = tokio::select! {
            signal = shutdown_signal() => Outcome::Signal(signal),
            result = self.receiver.finished() => Outcome::Finished(result),
        };

        match outcome {
            Outcome::Signal(signal) => {
                signal?;
                info!(endpoint = %self.endpoint, "Shutdown signal received");
                self.stop().await
            }
            Outcome::Finished(result) => {
                warn!(endpoint = %self.endpoint, "Receive loop ended");
                Ok(result?)
            }
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Build the context and services of `component` and install its receiver.
pub async fn start_component<C: EndpointComponent>(
    component: C,
    config: Arc<ConfigManager>,
    registry: Arc<TransportRegistry>,
) -> Result<RunningComponent<C>, ComponentError> {
    let endpoint = component.endpoint();
    let context = ComponentContext::new(config, registry.clone());
    let services = Arc::new(component.custom_modules(&context).await?);

    let handler = Arc::new(ComponentHandler {
        component: Arc::new(component),
        services: services.clone(),
        context: context.clone(),
    });
    let receiver = registry
        .install_receiver(endpoint.descriptor(), context.config(), handler)
        .await?;

    info!(endpoint = %endpoint, "Endpoint component started");

    Ok(RunningComponent {
        endpoint,
        receiver,
        services,
        context,
    })
}

/// Entry point for component binaries: logging, configuration, the builtin
/// transports, then run until shutdown.
pub async fn run_component<C: EndpointComponent>(component: C) -> Result<(), ComponentError> {
    init_tracing();

    let config = Arc::new(ConfigManager::load(None)?);
    let registry = Arc::new(TransportRegistry::builtin()?);

    start_component(component, config, registry)
        .await?
        .run_until_shutdown()
        .await
}
