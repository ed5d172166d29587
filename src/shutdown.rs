//! Supervisory shutdown signal
//!
//! Components never end the process themselves. They raise this signal and
//! the owner of the gatekeeper (the host binary, or a test) decides what to
//! do: stop accepting traffic, drain the server, exit.

use crate::error::GuardError;
use crate::types::DeviceStatus;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a shutdown was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The device reached a terminal status on the heartbeat stream
    DeviceRevoked(DeviceStatus),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceRevoked(status) => write!(f, "device revoked ({})", status),
        }
    }
}

impl From<ShutdownReason> for GuardError {
    fn from(reason: ShutdownReason) -> Self {
        match reason {
            ShutdownReason::DeviceRevoked(status) => GuardError::DeviceRevoked(status),
        }
    }
}

/// Process-wide shutdown broadcast
///
/// Cheap to clone; all clones observe the same signal. Once triggered it
/// stays triggered, and the first reason is kept.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal; returns false if it was already raised
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let raised = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });

        if raised {
            tracing::error!(reason = %reason, "Shutdown requested");
        }
        raised
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    /// Wait until the signal is raised
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // `self.tx` is alive for the duration of this borrow, so the
            // channel cannot close under us.
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("reason", &self.reason())
            .finish()
    }
}
