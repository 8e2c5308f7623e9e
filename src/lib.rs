//! # throttle-dl
//!
//! Host-local download orchestration and cooperative bandwidth throttling.
//!
//! Three tightly-coupled jobs live here:
//!
//! - the **bandwidth arbiter** observes active downloads and machine load
//!   and publishes per-download byte-rate allocations using a weighted
//!   fair-share scheme with minimum guarantees, idle burst, and
//!   interactive-latency protection;
//! - the **download engine** executes a single download over a pluggable
//!   transport with adaptive chunk sizing, parallel range fetching,
//!   throttled disk writes, and atomic finalization;
//! - the **supervised mesh** keeps the long-lived roles (arbiter,
//!   filesystem monitor, download pool, watchdog, system manager) alive
//!   through heartbeats and an authenticated loopback control fabric.
//!
//! ## Quick start
//!
//! ```no_run
//! use throttle_dl::{Config, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Runs the full mesh until SIGTERM/SIGINT
//!     run_with_shutdown(Config::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! Throttling is cooperative: every engine paces its own disk writes
//! against the rate the arbiter assigned, re-reading the assignment at
//! each chunk boundary. Nothing here touches kernel traffic shaping.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Bandwidth arbiter: scoring, allocation loop, system/latency probes
pub mod arbiter;
/// IPC bearer-token handling
pub mod auth;
/// Configuration types
pub mod config;
/// Throttled, chunked, fsync-disciplined disk writing
pub mod disk_writer;
/// Download engine: strategy, execution, finalization
pub mod engine;
/// Error types
pub mod error;
/// Loopback IPC framing and helpers
pub mod ipc;
/// Filesystem monitor for download takeover
pub mod monitor;
/// Download manager pool
pub mod pool;
/// Post-download scanner hook
pub mod scanner;
/// Supervisor, watchdog, heartbeats, system manager
pub mod supervisor;
/// Transport adapters
pub mod transport;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use arbiter::{Arbiter, ArbiterHandle, DownloadDirectory};
pub use config::Config;
pub use disk_writer::DiskWriter;
pub use engine::{DownloadEngine, EngineContext, EngineOutcome};
pub use error::{DiskError, Error, Result, TransportError};
pub use pool::DownloadPool;
pub use types::{
    AllocationSnapshot, DownloadId, DownloadSpec, DownloadState, Event, Mode, RateHandle,
};

use tokio_util::sync::CancellationToken;

/// Run the full supervised mesh with graceful signal handling.
///
/// Waits for a termination signal, then cancels every role and gives the
/// supervisor its bounded teardown window.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let mesh = tokio::spawn(supervisor::run_mesh(config, cancel.clone()));
    wait_for_signal().await;
    cancel.cancel();
    mesh.await
        .map_err(|e| Error::Other(format!("mesh task panicked: {e}")))?
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers,
    // tests); fall back progressively.
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
