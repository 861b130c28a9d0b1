//! Endpoint registry.
//!
//! An endpoint names one logical service of the pipeline. The name is used
//! both as the wire identifier and as the prefix of the endpoint's
//! configuration section (`<name>.sender.*`, `<name>.receiver.*`).
//!
//! The set of endpoints is closed: every process knows the same static table,
//! and lookups by name fail loudly for anything outside of it.

use std::fmt;
use std::marker::PhantomData;

use crate::message::{
    AdvisorRequest, AnalyzerRequest, ConfigRequest, EvaluatorRequest, NotifierRequest,
    OrchestratorMessage, ReporterRequest, ScannerRequest,
};

/// Errors raised by endpoint resolution.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Unknown endpoint '{0}'")]
    Unknown(String),
}

/// Untyped description of an endpoint.
///
/// This is what the transport layer works with; the payload type only matters
/// at the edges where messages are encoded and decoded.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
    name: &'static str,
}

impl EndpointDescriptor {
    const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// The unique name of the endpoint.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Prefix of this endpoint's configuration section.
    pub fn config_prefix(&self) -> &'static str {
        self.name
    }

    /// Prefix used for environment variables addressing this endpoint.
    pub fn env_prefix(&self) -> String {
        self.name.to_uppercase()
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

mod descriptors {
    use super::EndpointDescriptor;

    pub static ORCHESTRATOR: EndpointDescriptor = EndpointDescriptor::new("orchestrator");
    pub static CONFIG: EndpointDescriptor = EndpointDescriptor::new("config");
    pub static ANALYZER: EndpointDescriptor = EndpointDescriptor::new("analyzer");
    pub static ADVISOR: EndpointDescriptor = EndpointDescriptor::new("advisor");
    pub static SCANNER: EndpointDescriptor = EndpointDescriptor::new("scanner");
    pub static EVALUATOR: EndpointDescriptor = EndpointDescriptor::new("evaluator");
    pub static REPORTER: EndpointDescriptor = EndpointDescriptor::new("reporter");
    pub static NOTIFIER: EndpointDescriptor = EndpointDescriptor::new("notifier");
}

/// All known endpoints, in pipeline order.
pub static ENDPOINTS: [&EndpointDescriptor; 8] = [
    &descriptors::ORCHESTRATOR,
    &descriptors::CONFIG,
    &descriptors::ANALYZER,
    &descriptors::ADVISOR,
    &descriptors::SCANNER,
    &descriptors::EVALUATOR,
    &descriptors::REPORTER,
    &descriptors::NOTIFIER,
];

/// Look up an endpoint by its (case-sensitive) name.
///
/// Returns the same static descriptor on every call for a known name.
pub fn resolve_endpoint(name: &str) -> Result<&'static EndpointDescriptor, EndpointError> {
    ENDPOINTS
        .iter()
        .copied()
        .find(|endpoint| endpoint.name == name)
        .ok_or_else(|| EndpointError::Unknown(name.to_string()))
}

/// An endpoint bound to the payload type it accepts.
///
/// Only the statics in this module construct values of this type, so a
/// message can never be published to an endpoint that does not understand
/// its payload.
pub struct Endpoint<T> {
    descriptor: &'static EndpointDescriptor,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Endpoint<T> {
    const fn new(descriptor: &'static EndpointDescriptor) -> Self {
        Self {
            descriptor,
            _payload: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &'static EndpointDescriptor {
        self.descriptor
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }
}

impl<T> Clone for Endpoint<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Endpoint<T> {}

impl<T> fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Endpoint").field(&self.descriptor.name).finish()
    }
}

impl<T> fmt::Display for Endpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor.name)
    }
}

/// The coordinator driving the pipeline.
pub static ORCHESTRATOR: Endpoint<OrchestratorMessage> =
    Endpoint::new(&descriptors::ORCHESTRATOR);
/// Resolves the configuration of a pipeline run.
pub static CONFIG: Endpoint<ConfigRequest> = Endpoint::new(&descriptors::CONFIG);
pub static ANALYZER: Endpoint<AnalyzerRequest> = Endpoint::new(&descriptors::ANALYZER);
pub static ADVISOR: Endpoint<AdvisorRequest> = Endpoint::new(&descriptors::ADVISOR);
pub static SCANNER: Endpoint<ScannerRequest> = Endpoint::new(&descriptors::SCANNER);
pub static EVALUATOR: Endpoint<EvaluatorRequest> = Endpoint::new(&descriptors::EVALUATOR);
pub static REPORTER: Endpoint<ReporterRequest> = Endpoint::new(&descriptors::REPORTER);
pub static NOTIFIER: Endpoint<NotifierRequest> = Endpoint::new(&descriptors::NOTIFIER);
