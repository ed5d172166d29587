//! Error types for appguard

use crate::types::{DeviceStatus, Stage};
use thiserror::Error;

/// Errors that can occur in the gatekeeper
#[derive(Debug, Error)]
pub enum GuardError {
    /// Decision channel could not become ready before its deadline
    #[error("Connection error: {0}")]
    Connection(String),

    /// Startup ruleset push failed or was not acknowledged
    #[error("Failed to push firewall policy: {0}")]
    PolicyPush(String),

    /// A decision call failed at the transport level
    #[error("Decision call failed at {stage} stage: {reason}")]
    Transport {
        stage: Stage,
        reason: String,
    },

    /// Heartbeat subscription could not be opened or broke
    #[error("Heartbeat subscription error: {0}")]
    Subscribe(String),

    /// A decision call was attempted before any credential was received
    #[error("No session credential has been received yet")]
    CredentialUnavailable,

    /// The remote service reported a terminal device status
    #[error("Device has been revoked (status: {0})")]
    DeviceRevoked(DeviceStatus),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential persistence failure
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl GuardError {
    /// Build a transport error for a decision stage
    pub fn transport(stage: Stage, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for gatekeeper operations
pub type Result<T> = std::result::Result<T, GuardError>;
