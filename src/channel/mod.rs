//! Decision channel trait: the connection to the remote policy service
//!
//! The gatekeeper never evaluates rules itself. Every admit/deny decision,
//! the startup ruleset push, and the credential heartbeat go through a
//! `DecisionChannel`. Implementations must be safe for concurrent use: one
//! channel is shared by every in-flight request for the life of the process.

use crate::error::Result;
use crate::types::{
    ConnectionDescriptor, DeviceIdentity, FirewallUpdate, Heartbeat, LogBatch, PolicyAck,
    RequestDescriptor, ResponseDescriptor, Verdict,
};
use async_trait::async_trait;

pub mod memory;
pub mod nats;

/// Core trait for decision service backends
///
/// Each call resolves with the remote verdict or fails with a transport
/// error. Dropping a call future before it settles must release whatever
/// the call holds, since the arbiter cancels the loser of a timeout race
/// that way.
#[async_trait]
pub trait DecisionChannel: Send + Sync {
    /// Connection stage; the verdict carries the TCP context
    async fn check_connection(&self, connection: &ConnectionDescriptor) -> Result<Verdict>;

    /// Request stage
    async fn check_request(&self, request: &RequestDescriptor) -> Result<Verdict>;

    /// Response stage
    async fn check_response(&self, response: &ResponseDescriptor) -> Result<Verdict>;

    /// Install the ruleset on the service (used once at startup)
    async fn push_policy(&self, update: &FirewallUpdate) -> Result<PolicyAck>;

    /// Open the standing heartbeat subscription for this device
    async fn subscribe_heartbeat(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Box<dyn HeartbeatStream>>;

    /// Ship a batch of application logs
    ///
    /// Default implementation discards the batch. Backends without a log
    /// sink need not override this.
    async fn send_logs(&self, _batch: &LogBatch) -> Result<()> {
        Ok(())
    }

    /// Backend name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

/// Async stream of heartbeat events
#[async_trait]
pub trait HeartbeatStream: Send {
    /// Receive the next heartbeat
    ///
    /// `Ok(None)` means the stream ended; `Err` means it broke. Either way
    /// the subscription is finished and must be reopened.
    async fn next(&mut self) -> Result<Option<Heartbeat>>;
}
