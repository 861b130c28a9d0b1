//! scanbus-check: validate transport configuration before deployment
//!
//! Loads configuration the same way every component does and resolves the
//! sender and receiver transport of each endpoint, without connecting to
//! anything. Exits non-zero if any endpoint is misconfigured.
//!
//! ## Usage
//! ```text
//! scanbus-check [--config <path>] [endpoint...]
//! ```
//!
//! With no endpoint names, every known endpoint is checked.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use scanbus::config::ConfigManager;
use scanbus::endpoint::{resolve_endpoint, EndpointDescriptor, ENDPOINTS};
use scanbus::transport::{Direction, TransportRegistry};
use scanbus::utils::bootstrap::init_tracing;

/// Validate scanbus transport configuration
#[derive(Parser, Debug)]
#[command(name = "scanbus-check")]
#[command(about = "Resolve every endpoint's transports without connecting", long_about = None)]
struct Args {
    /// Configuration file layered over config.yaml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Endpoints to check (default: all)
    endpoints: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config_path = args.config.as_ref().map(|path| path.to_string_lossy());
    let config = match ConfigManager::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let registry = match TransportRegistry::builtin() {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "Failed to build transport registry");
            return ExitCode::FAILURE;
        }
    };
    info!(
        senders = ?registry.sender_types(),
        receivers = ?registry.receiver_types(),
        "Available transports"
    );

    let mut failures = 0usize;

    let endpoints: Vec<&'static EndpointDescriptor> = if args.endpoints.is_empty() {
        ENDPOINTS.to_vec()
    } else {
        let mut selected = Vec::new();
        for name in &args.endpoints {
            match resolve_endpoint(name) {
                Ok(endpoint) => selected.push(endpoint),
                Err(e) => {
                    error!(error = %e, "Cannot check endpoint");
                    failures += 1;
                }
            }
        }
        selected
    };

    for endpoint in endpoints {
        for direction in Direction::ALL {
            let resolved = match direction {
                Direction::Sender => registry
                    .resolve_sender_factory(endpoint, &config)
                    .map(|(_, transport)| transport),
                Direction::Receiver => registry
                    .resolve_receiver_factory(endpoint, &config)
                    .map(|(_, transport)| transport),
            };

            match resolved {
                Ok(transport) => info!(
                    endpoint = %endpoint,
                    direction = %direction,
                    transport = transport.transport_type(),
                    "OK"
                ),
                Err(e) => {
                    error!(
                        endpoint = %endpoint,
                        direction = %direction,
                        error = %e,
                        "Misconfigured"
                    );
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        error!(failures, "Configuration check failed");
        ExitCode::FAILURE
    } else {
        info!("Configuration check passed");
        ExitCode::SUCCESS
    }
}
