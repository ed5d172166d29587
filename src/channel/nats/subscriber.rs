//! NATS heartbeat subscription

use crate::channel::HeartbeatStream;
use crate::error::{GuardError, Result};
use crate::types::Heartbeat;
use async_trait::async_trait;
use futures::StreamExt;

/// Heartbeat stream backed by a NATS inbox subscription
///
/// The inbox is unsubscribed when the stream is dropped.
pub struct NatsHeartbeatStream {
    subscriber: async_nats::Subscriber,
}

impl NatsHeartbeatStream {
    pub(crate) fn new(subscriber: async_nats::Subscriber) -> Self {
        Self { subscriber }
    }
}

#[async_trait]
impl HeartbeatStream for NatsHeartbeatStream {
    async fn next(&mut self) -> Result<Option<Heartbeat>> {
        let Some(msg) = self.subscriber.next().await else {
            return Ok(None);
        };

        let heartbeat = serde_json::from_slice::<Heartbeat>(&msg.payload).map_err(|e| {
            GuardError::Subscribe(format!(
                "undecodable heartbeat on {}: {}",
                msg.subject, e
            ))
        })?;

        tracing::debug!(status = %heartbeat.status, "Received heartbeat from server");
        Ok(Some(heartbeat))
    }
}
