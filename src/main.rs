//! shaderd: a shader compilation server
//!
//! Clients connect over TCP, send one framed GLSL source (vertex or
//! fragment), and receive the compiled binary back on the same connection.
//!
//! Features:
//! - Single-threaded mio reactor serving many interleaved connections
//! - Strict header validation before any payload is read
//! - Optional worker pool so slow compiles do not stall the reactor
//! - One-shot `compile` mode for a single file
//! - Configuration via CLI arguments or TOML file

mod backend;
mod config;
mod oneshot;
mod protocol;
mod runtime;

use backend::{NagaBackend, SharedBackend};
use config::{Config, Mode};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let backend: SharedBackend = Arc::new(NagaBackend::new());
    info!(
        backend = backend.name(),
        target = %backend.describe(),
        "Compilation backend ready"
    );

    match &config.mode {
        Mode::Serve => serve(&config, backend),
        Mode::Compile { input, output } => compile(backend, input, output.as_deref()),
    }
}

/// Run the TCP compile server until it stops.
fn serve(config: &Config, backend: SharedBackend) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        failure_sentinel = config.failure_sentinel,
        "Starting shaderd server"
    );
    runtime::run(config, backend)?;
    info!("Server stopped");
    Ok(())
}

/// Compile one file and exit.
fn compile(
    backend: SharedBackend,
    input: &std::path::Path,
    output: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = oneshot::compile_file(backend.as_ref(), input, output) {
        error!(error = %e, "One-shot compile failed");
        return Err(e.into());
    }
    Ok(())
}
