//! NATS decision channel
//!
//! Implements `DecisionChannel` over NATS core request/reply with JSON
//! payloads. Dropping an in-flight request releases its reply inbox, so a
//! call that lost a timeout race stops occupying the connection.

mod client;
mod subscriber;

pub use client::NatsClient;
pub use subscriber::NatsHeartbeatStream;

use crate::channel::{DecisionChannel, HeartbeatStream};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::types::{
    ConnectionDescriptor, DeviceIdentity, FirewallUpdate, LogBatch, PolicyAck,
    RequestDescriptor, ResponseDescriptor, Stage, Verdict,
};
use async_trait::async_trait;
use client::{FIREWALL, HTTP_REQUEST, HTTP_RESPONSE, TCP_CONNECTION};

/// NATS decision channel
///
/// Wraps `NatsClient` and implements the `DecisionChannel` trait.
pub struct NatsChannel {
    client: NatsClient,
}

impl NatsChannel {
    /// Connect and wait for readiness (bounded by `readyTimeoutSecs`)
    pub async fn initialize(config: GuardConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl DecisionChannel for NatsChannel {
    async fn check_connection(&self, connection: &ConnectionDescriptor) -> Result<Verdict> {
        self.client
            .decide(Stage::Connection, TCP_CONNECTION, connection)
            .await
    }

    async fn check_request(&self, request: &RequestDescriptor) -> Result<Verdict> {
        self.client.decide(Stage::Request, HTTP_REQUEST, request).await
    }

    async fn check_response(&self, response: &ResponseDescriptor) -> Result<Verdict> {
        self.client.decide(Stage::Response, HTTP_RESPONSE, response).await
    }

    async fn push_policy(&self, update: &FirewallUpdate) -> Result<PolicyAck> {
        self.client
            .request(FIREWALL, update, GuardError::PolicyPush)
            .await
    }

    async fn subscribe_heartbeat(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Box<dyn HeartbeatStream>> {
        let stream = self.client.subscribe_heartbeat(identity).await?;
        Ok(Box::new(stream))
    }

    async fn send_logs(&self, batch: &LogBatch) -> Result<()> {
        self.client.publish_logs(batch).await
    }

    fn name(&self) -> &str {
        "nats"
    }
}
