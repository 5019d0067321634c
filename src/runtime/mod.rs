//! Networking runtime for the compile server.
//!
//! - `EventLoop`: single-threaded mio reactor (epoll on Linux, kqueue on macOS)
//! - `Connection`: per-client request state machine
//! - `CompilePool`: optional worker threads for backend calls
//! - `token`: poll token layout

mod connection;
mod event_loop;
mod pool;
mod token;

use event_loop::{EventLoop, ShutdownHandle};

use crate::backend::SharedBackend;
use crate::config::Config;
use tracing::{info, warn};

/// Bind the listener and serve until the event loop stops.
///
/// SIGINT and SIGTERM stop the loop; in-flight compiles finish and the
/// worker pool is joined before this returns.
pub fn run(config: &Config, backend: SharedBackend) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(config, backend)?;

    if let Err(e) = install_signal_handler(event_loop.shutdown_handle()) {
        warn!(error = %e, "Failed to install signal handler");
    }

    event_loop.run()
}

fn install_signal_handler(handle: ShutdownHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        if let Err(e) = handle.shutdown() {
            warn!(error = %e, "Failed to wake event loop");
        }
    })
}
