//! Signal handling for graceful shutdown (SIGINT/SIGTERM)
//!
//! - First signal: cancel the server's shutdown token, which stops the
//!   listeners and drains in-flight requests
//! - Second signal: exit immediately
//! - Further signals: ignored

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exit code when a second signal interrupts the drain
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Counts received signals; the count alone decides the action.
#[derive(Debug, Default)]
pub struct SignalState {
    received: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a drain has been requested.
    pub fn is_draining(&self) -> bool {
        self.received() >= 1
    }

    /// Whether the drain was cut short by a second signal.
    pub fn is_forced(&self) -> bool {
        self.received() >= 2
    }

    pub fn received(&self) -> u8 {
        self.received.load(Ordering::SeqCst)
    }

    /// Record a signal and return the action to take.
    pub fn handle_signal(&self) -> SignalAction {
        let previous = self
            .received
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or(u8::MAX);
        match previous {
            0 => SignalAction::InitiateShutdown,
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Stop accepting and drain
    InitiateShutdown,
    /// Exit without waiting for the drain
    ImmediateExit,
    Ignore,
}

/// Installs process signal handlers that drive a shutdown token.
#[derive(Debug, Default)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install handlers for SIGINT and SIGTERM. Call once per process.
    pub fn install(&self, shutdown: CancellationToken) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateShutdown => {
                warn!("received interrupt signal, draining in-flight requests");
                shutdown.cancel();
            }
            SignalAction::ImmediateExit => {
                warn!("received second interrupt, exiting immediately");
                std::process::exit(EXIT_CODE_INTERRUPTED);
            }
            SignalAction::Ignore => {}
        })
    }
}
