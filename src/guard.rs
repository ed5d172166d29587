//! Gatekeeper assembly and startup ordering
//!
//! `AppGuard` is the only way to obtain a live `Pipeline`. It starts the
//! credential refresh, waits for the first credential, installs the
//! ruleset, and only then hands the pipeline out, so no request can be
//! decided against a service that has not acknowledged our ruleset.

use crate::arbiter::Arbiter;
use crate::channel::nats::NatsChannel;
use crate::channel::DecisionChannel;
use crate::config::GuardConfig;
use crate::credential::{CredentialManager, Credentials};
use crate::error::{GuardError, Result};
use crate::logs::{LogShipper, RemoteLogLayer};
use crate::pipeline::Pipeline;
use crate::shutdown::ShutdownSignal;
use crate::state::{FileTokenStore, MemoryTokenStore, TokenStore};
use crate::sync::sync_policy;
use crate::types::{DeviceIdentity, PolicyAck};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A started gatekeeper
///
/// Background tasks (credential refresh, log shipping) are aborted when
/// this is dropped.
pub struct AppGuard {
    channel: Arc<dyn DecisionChannel>,
    pipeline: Arc<Pipeline>,
    credentials: Credentials,
    shutdown: ShutdownSignal,
    policy_ack: PolicyAck,
    tasks: Vec<JoinHandle<()>>,
}

impl AppGuard {
    /// Connect to the decision service over NATS and start
    ///
    /// The credential is persisted to `tokenPath` when configured, and kept
    /// in memory otherwise.
    pub async fn connect(config: GuardConfig, identity: DeviceIdentity) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn TokenStore> = match &config.token_path {
            Some(path) => Arc::new(FileTokenStore::new(path)),
            None => Arc::new(MemoryTokenStore::default()),
        };
        let channel = NatsChannel::initialize(config.clone()).await?;

        Self::start(config, channel, identity, store).await
    }

    /// Start on an already initialized channel
    ///
    /// Returns once the ruleset has been acknowledged. Fails with
    /// `PolicyPush` if it was not, or with `DeviceRevoked` if the device is
    /// revoked before startup completes.
    pub async fn start(
        config: GuardConfig,
        channel: impl DecisionChannel + 'static,
        identity: DeviceIdentity,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        config.validate()?;
        let channel: Arc<dyn DecisionChannel> = Arc::new(channel);
        let shutdown = ShutdownSignal::new();

        let manager = CredentialManager::new(
            channel.clone(),
            identity,
            store,
            shutdown.clone(),
            config.heartbeat_retry(),
        )
        .with_idle_timeout(config.heartbeat_idle());
        let credentials = manager.credentials();
        let heartbeat = manager.spawn();

        let synced = tokio::select! {
            biased;
            reason = shutdown.wait() => Err(GuardError::from(reason)),
            ack = sync_policy(channel.as_ref(), &credentials, &config.firewall) => ack,
        };
        let policy_ack = match synced {
            Ok(ack) => ack,
            Err(e) => {
                heartbeat.abort();
                tracing::error!(error = %e, "AppGuard failed to start");
                return Err(e);
            }
        };

        let pipeline = Pipeline::new(
            channel.clone(),
            credentials.clone(),
            Arbiter::new(config.default_policy, config.call_timeout()),
            shutdown.clone(),
        );

        tracing::info!(
            backend = channel.name(),
            default_policy = %config.default_policy,
            timeout_ms = config.timeout,
            "AppGuard ready"
        );

        Ok(Self {
            channel,
            pipeline: Arc::new(pipeline),
            credentials,
            shutdown,
            policy_ack,
            tasks: vec![heartbeat],
        })
    }

    /// The live pipeline
    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Signal raised when the device is revoked
    ///
    /// The owner is expected to stop serving and exit once it fires.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Acknowledgement received for the startup ruleset push
    pub fn policy_ack(&self) -> &PolicyAck {
        &self.policy_ack
    }

    /// Start shipping host logs; add the returned layer to the host's
    /// `tracing` subscriber
    pub fn remote_logs(&mut self) -> RemoteLogLayer {
        let (layer, shipper) = LogShipper::new(
            self.channel.clone(),
            self.credentials.clone(),
            self.shutdown.clone(),
        );
        self.tasks.push(shipper.spawn());
        layer
    }
}

impl Drop for AppGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for AppGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppGuard")
            .field("backend", &self.channel.name())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::{MemoryChannel, Reply};
    use crate::types::{DeviceStatus, FirewallPolicy, Heartbeat};

    fn config() -> GuardConfig {
        GuardConfig {
            firewall: r#"[{"deny":"/admin"}]"#.to_string(),
            default_policy: FirewallPolicy::Deny,
            timeout: Some(500),
            ..Default::default()
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("app-1", "secret")
    }

    #[tokio::test]
    async fn test_start_blocks_until_first_credential() {
        let channel = MemoryChannel::new();
        let start = tokio::spawn(AppGuard::start(
            config(),
            channel.clone(),
            identity(),
            Arc::new(MemoryTokenStore::default()),
        ));

        channel.wait_for_subscriptions(1).await;
        tokio::task::yield_now().await;
        assert!(!start.is_finished());
        assert!(channel.calls().pushes.is_empty());

        channel.emit_heartbeat(Heartbeat::new("tok-1", DeviceStatus::Online));
        let guard = start.await.unwrap().unwrap();

        assert!(guard.policy_ack().accepted);
        let pushes = channel.calls().pushes;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].token, "tok-1");
        assert_eq!(pushes[0].firewall, r#"[{"deny":"/admin"}]"#);
        assert_eq!(guard.pipeline().arbiter().default_policy(), FirewallPolicy::Deny);
    }

    #[tokio::test]
    async fn test_persisted_credential_starts_immediately() {
        let channel = MemoryChannel::new();
        let guard = AppGuard::start(
            config(),
            channel.clone(),
            identity(),
            Arc::new(MemoryTokenStore::with_token("persisted")),
        )
        .await
        .unwrap();

        assert_eq!(guard.credentials().token().unwrap(), "persisted");
        assert_eq!(channel.calls().pushes[0].token, "persisted");
    }

    #[tokio::test]
    async fn test_rejected_ruleset_aborts_start() {
        let channel = MemoryChannel::new();
        channel.on_firewall(|_| Reply::Respond(PolicyAck::rejected("parse error")));

        let err = AppGuard::start(
            config(),
            channel,
            identity(),
            Arc::new(MemoryTokenStore::with_token("tok")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GuardError::PolicyPush(_)));
    }

    #[tokio::test]
    async fn test_revocation_during_startup() {
        let channel = MemoryChannel::new();
        let start = tokio::spawn(AppGuard::start(
            config(),
            channel.clone(),
            identity(),
            Arc::new(MemoryTokenStore::default()),
        ));

        channel.wait_for_subscriptions(1).await;
        channel.emit_heartbeat(Heartbeat::new("tok", DeviceStatus::Deleted));

        let err = start.await.unwrap().unwrap_err();
        assert!(matches!(err, GuardError::DeviceRevoked(DeviceStatus::Deleted)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = GuardConfig {
            host: String::new(),
            ..Default::default()
        };
        let err = AppGuard::start(
            config,
            MemoryChannel::new(),
            identity(),
            Arc::new(MemoryTokenStore::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
    }
}
