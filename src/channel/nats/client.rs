//! NATS client: connect, request/reply decisions, heartbeat subscription

use super::subscriber::NatsHeartbeatStream;
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::types::{DeviceIdentity, LogBatch, Stage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Subject suffixes for each channel operation
pub(crate) const TCP_CONNECTION: &str = "tcp_connection";
pub(crate) const HTTP_REQUEST: &str = "http_request";
pub(crate) const HTTP_RESPONSE: &str = "http_response";
pub(crate) const FIREWALL: &str = "firewall";
pub(crate) const HEARTBEAT: &str = "heartbeat";
pub(crate) const LOGS: &str = "logs";

/// Pause between connection attempts while waiting for readiness
const CONNECT_RETRY: Duration = Duration::from_millis(250);

/// NATS client
///
/// Low-level client for the decision service. Holds one multiplexed
/// connection; concurrent requests share it without serialization.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// Configuration
    config: Arc<GuardConfig>,
}

impl NatsClient {
    /// Connect to the decision service, blocking until the connection is
    /// ready or the readiness deadline elapses
    pub async fn connect(config: GuardConfig) -> Result<Self> {
        let url = config.server_url();

        let client = tokio::time::timeout(config.ready_timeout(), connect_until_ready(&config, &url))
            .await
            .map_err(|_| {
                GuardError::Connection(format!(
                    "{} not ready within {}s",
                    url, config.ready_timeout_secs
                ))
            })?;

        tracing::info!(url = %url, tls = config.tls, "Connected to AppGuard service");

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Issue one request and decode the reply
    ///
    /// `on_error` turns a transport or decode failure into the caller's
    /// error class.
    pub async fn request<T, R>(
        &self,
        operation: &str,
        payload: &T,
        on_error: impl Fn(String) -> GuardError,
    ) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let subject = self.config.subject(operation);
        let payload = serde_json::to_vec(payload)?;

        let reply = self
            .client
            .request(subject.clone(), payload.into())
            .await
            .map_err(|e| on_error(format!("{}: {}", subject, e)))?;

        serde_json::from_slice(&reply.payload)
            .map_err(|e| on_error(format!("undecodable reply on {}: {}", subject, e)))
    }

    /// Issue a decision request for one stage
    pub async fn decide<T, R>(&self, stage: Stage, operation: &str, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request(operation, payload, |reason| GuardError::transport(stage, reason))
            .await
    }

    /// Open the heartbeat subscription on a fresh reply inbox
    pub async fn subscribe_heartbeat(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<NatsHeartbeatStream> {
        let inbox = self.client.new_inbox();
        let subscriber = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| GuardError::Subscribe(format!("{}: {}", inbox, e)))?;

        let subject = self.config.subject(HEARTBEAT);
        let payload = serde_json::to_vec(identity)?;
        self.client
            .publish_with_reply(subject.clone(), inbox, payload.into())
            .await
            .map_err(|e| GuardError::Subscribe(format!("{}: {}", subject, e)))?;

        tracing::info!(
            subject = %subject,
            app_id = %identity.app_id,
            "Heartbeat subscription opened"
        );

        Ok(NatsHeartbeatStream::new(subscriber))
    }

    /// Publish a log batch without waiting for a reply
    pub async fn publish_logs(&self, batch: &LogBatch) -> Result<()> {
        let subject = self.config.subject(LOGS);
        let payload = serde_json::to_vec(batch)?;
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| GuardError::Connection(format!("{}: {}", subject, e)))
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }
}

/// Retry connecting until one attempt succeeds; bounded by the caller's deadline
async fn connect_until_ready(config: &GuardConfig, url: &str) -> async_nats::Client {
    loop {
        match build_connect_options(config).connect(url).await {
            Ok(client) => return client,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "AppGuard service not ready, retrying");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &GuardConfig) -> async_nats::ConnectOptions {
    // No client-side request timeout: decision latency is bounded by the
    // arbiter, and only when a timeout is configured.
    async_nats::ConnectOptions::new()
        .name("appguard")
        .connection_timeout(config.ready_timeout())
        .request_timeout(None)
        .require_tls(config.tls)
}
