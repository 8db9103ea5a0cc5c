//! Shared tunnel connection state.
//!
//! One instance per engine, shared between the ICE sessions (which drive the
//! transitions) and the status socket (which reports them).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connected,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Disconnected => write!(f, "disconnected"),
            TunnelState::Connected => write!(f, "connected"),
        }
    }
}

/// Atomic status indicator with a one-shot readiness latch. The latch fires
/// on the first `connected` transition and stays fired: later transitions
/// only move the status enum.
#[derive(Debug)]
pub struct ConnectState {
    status: AtomicU8,
    ready_tx: watch::Sender<bool>,
}

impl ConnectState {
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            status: AtomicU8::new(0),
            ready_tx,
        }
    }

    pub fn connected(&self) {
        self.status.store(1, Ordering::SeqCst);
        self.ready_tx.send_replace(true);
    }

    pub fn disconnected(&self) {
        self.status.store(0, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.status.load(Ordering::SeqCst) == 1
    }

    pub fn status(&self) -> TunnelState {
        if self.is_connected() {
            TunnelState::Connected
        } else {
            TunnelState::Disconnected
        }
    }

    /// Wait until the first `connected` transition. Returns immediately on
    /// every call after that, regardless of the current status.
    pub async fn await_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we
        // are borrowed from it.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ConnectState {
    fn default() -> Self {
        Self::new()
    }
}
