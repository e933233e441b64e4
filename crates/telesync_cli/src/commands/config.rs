//! Config command implementation.

use std::path::Path;
use telesync_engine::{EndpointConfig, TransportKind};

/// Endpoint used when neither a file nor `--endpoint` names one.
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/telemetry";

/// Builds the effective configuration: the file (or defaults), then
/// command-line overrides, then validation.
pub fn resolve(
    path: Option<&Path>,
    endpoint: Option<String>,
    transport: Option<TransportKind>,
) -> Result<EndpointConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => EndpointConfig::from_file(path)?,
        None => EndpointConfig::pull(DEFAULT_ENDPOINT),
    };
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    if let Some(transport) = transport {
        config.transport_kind = transport;
    }
    config.validate()?;
    Ok(config)
}

/// Runs the config command.
pub fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve(path, None, None)?;
    println!("{}", config.to_json_pretty()?);
    Ok(())
}
