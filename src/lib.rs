//! Scanbus - message bus for staged code-analysis pipelines
//!
//! A coordinator and a set of workers (analyzer, advisor, scanner, evaluator,
//! reporter, notifier) exchange JSON messages over named endpoints. The
//! transport behind each endpoint and direction is chosen by configuration,
//! so the same components run in one process over channels or across
//! processes over RabbitMQ.

pub mod component;
pub mod config;
pub mod endpoint;
pub mod message;
pub mod publisher;
pub mod transport;
pub mod utils;
pub mod worker;

pub use component::{
    run_component, start_component, ComponentContext, ComponentError, EndpointComponent,
    RunningComponent,
};
pub use config::{ConfigError, ConfigManager};
pub use endpoint::{Endpoint, EndpointDescriptor};
pub use message::{Message, MessageHeader, OrchestratorMessage};
pub use publisher::MessagePublisher;
pub use transport::{EndpointHandlerResult, TransportError, TransportRegistry};
