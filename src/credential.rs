//! Session credential lifecycle
//!
//! `CredentialManager` owns the heartbeat subscription. Each heartbeat
//! replaces the cached credential and persists it; a terminal device status
//! raises the shutdown signal; a broken or finished stream is reopened after
//! a fixed delay, forever. Readers hold a `Credentials` handle and always
//! see the latest value without locking.

use crate::channel::{DecisionChannel, HeartbeatStream};
use crate::error::{GuardError, Result};
use crate::shutdown::{ShutdownReason, ShutdownSignal};
use crate::state::TokenStore;
use crate::types::{DeviceIdentity, Heartbeat};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Read handle on the current session credential
#[derive(Clone, Debug)]
pub struct Credentials {
    rx: watch::Receiver<Option<String>>,
}

impl Credentials {
    /// A handle that always yields `token`, with no refresh behind it
    pub fn fixed(token: impl Into<String>) -> Self {
        let (_, rx) = watch::channel(Some(token.into()));
        Self { rx }
    }

    /// Current credential, or `CredentialUnavailable` if none was ever received
    pub fn token(&self) -> Result<String> {
        self.current().ok_or(GuardError::CredentialUnavailable)
    }

    pub fn current(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Wait until a credential is available and return it
    ///
    /// Resolves immediately when a persisted credential was loaded at startup.
    pub async fn init(&self) -> Result<String> {
        let mut rx = self.rx.clone();
        let token = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| GuardError::CredentialUnavailable)?
            .clone();
        token.ok_or(GuardError::CredentialUnavailable)
    }
}

/// How one subscription ended
enum StreamEnd {
    /// Shutdown was raised; do not resubscribe
    Stopped,
    /// The stream finished without error
    Closed,
    /// The stream broke
    Failed(GuardError),
}

/// Keeps the session credential fresh from the heartbeat subscription
pub struct CredentialManager {
    channel: Arc<dyn DecisionChannel>,
    identity: DeviceIdentity,
    store: Arc<dyn TokenStore>,
    shutdown: ShutdownSignal,
    retry_delay: Duration,
    idle_timeout: Option<Duration>,
    tx: watch::Sender<Option<String>>,
}

impl CredentialManager {
    /// Create a manager, seeding the cache from the store when it holds a
    /// readable credential
    pub fn new(
        channel: Arc<dyn DecisionChannel>,
        identity: DeviceIdentity,
        store: Arc<dyn TokenStore>,
        shutdown: ShutdownSignal,
        retry_delay: Duration,
    ) -> Self {
        let persisted = match store.load() {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable persisted credential");
                None
            }
        };

        if persisted.is_some() {
            tracing::info!("Loaded persisted session credential");
        }

        let (tx, _) = watch::channel(persisted);
        Self {
            channel,
            identity,
            store,
            shutdown,
            retry_delay,
            idle_timeout: None,
            tx,
        }
    }

    /// Treat the stream as broken when no heartbeat arrives within `idle`
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    /// Get a read handle on the credential
    pub fn credentials(&self) -> Credentials {
        Credentials {
            rx: self.tx.subscribe(),
        }
    }

    /// Run the refresh loop as a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Refresh loop; returns only once shutdown has been raised
    pub async fn run(self) {
        loop {
            if self.shutdown.is_triggered() {
                return;
            }

            match self.channel.subscribe_heartbeat(&self.identity).await {
                Ok(mut stream) => match self.consume(stream.as_mut()).await {
                    StreamEnd::Stopped => return,
                    StreamEnd::Closed => tracing::warn!(
                        retry_secs = self.retry_delay.as_secs(),
                        "Heartbeat stream closed, resubscribing after delay"
                    ),
                    StreamEnd::Failed(e) => tracing::warn!(
                        error = %e,
                        retry_secs = self.retry_delay.as_secs(),
                        "Error in heartbeat, resubscribing after delay"
                    ),
                },
                Err(e) => tracing::warn!(
                    error = %e,
                    retry_secs = self.retry_delay.as_secs(),
                    "Failed to open heartbeat subscription, retrying after delay"
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.shutdown.wait() => return,
            }
        }
    }

    async fn consume(&self, stream: &mut dyn HeartbeatStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.wait() => return StreamEnd::Stopped,
                next = self.next_heartbeat(stream) => next,
            };

            match next {
                Ok(Some(heartbeat)) => {
                    if self.apply(heartbeat) {
                        return StreamEnd::Stopped;
                    }
                }
                Ok(None) => return StreamEnd::Closed,
                Err(e) => return StreamEnd::Failed(e),
            }
        }
    }

    async fn next_heartbeat(
        &self,
        stream: &mut dyn HeartbeatStream,
    ) -> Result<Option<Heartbeat>> {
        let Some(idle) = self.idle_timeout else {
            return stream.next().await;
        };
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(next) => next,
            Err(_) => Err(GuardError::Subscribe(format!(
                "no heartbeat within {}s",
                idle.as_secs()
            ))),
        }
    }

    /// Apply one heartbeat; returns true if the device is revoked
    fn apply(&self, heartbeat: Heartbeat) -> bool {
        let revoked = heartbeat.status.is_terminal();
        if revoked {
            tracing::error!(
                status = %heartbeat.status,
                "Device is archived or deleted, requesting shutdown"
            );
            self.shutdown
                .trigger(ShutdownReason::DeviceRevoked(heartbeat.status));
        }

        if let Err(e) = self.store.save(&heartbeat.token) {
            tracing::warn!(error = %e, "Failed to persist session credential");
        }
        self.tx.send_replace(Some(heartbeat.token));

        tracing::debug!(status = %heartbeat.status, "Session credential refreshed");
        revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryChannel;
    use crate::state::MemoryTokenStore;
    use crate::types::DeviceStatus;

    struct BrokenStore;

    impl TokenStore for BrokenStore {
        fn save(&self, _token: &str) -> Result<()> {
            Err(GuardError::Persistence("read-only".to_string()))
        }

        fn load(&self) -> Result<Option<String>> {
            Err(GuardError::Persistence("corrupt".to_string()))
        }
    }

    const RETRY: Duration = Duration::from_secs(10);

    fn manager(
        channel: &MemoryChannel,
        store: Arc<dyn TokenStore>,
    ) -> (CredentialManager, ShutdownSignal) {
        let shutdown = ShutdownSignal::new();
        let manager = CredentialManager::new(
            Arc::new(channel.clone()),
            DeviceIdentity::new("app-1", "secret"),
            store,
            shutdown.clone(),
            RETRY,
        );
        (manager, shutdown)
    }

    #[tokio::test]
    async fn test_init_waits_for_first_heartbeat() {
        let channel = MemoryChannel::new();
        let store = Arc::new(MemoryTokenStore::default());
        let (manager, _shutdown) = manager(&channel, store.clone());
        let creds = manager.credentials();

        assert!(matches!(creds.token(), Err(GuardError::CredentialUnavailable)));

        let mut init = tokio_test::task::spawn(creds.init());
        tokio_test::assert_pending!(init.poll());

        let handle = manager.spawn();
        channel.wait_for_subscriptions(1).await;
        assert!(channel.emit_heartbeat(Heartbeat::new("tok-1", DeviceStatus::Online)));

        assert_eq!(creds.init().await.unwrap(), "tok-1");
        assert!(init.is_woken());
        assert_eq!(tokio_test::assert_ready!(init.poll()).unwrap(), "tok-1");
        assert_eq!(creds.token().unwrap(), "tok-1");
        assert_eq!(store.load().unwrap().as_deref(), Some("tok-1"));
        handle.abort();
    }

    #[tokio::test]
    async fn test_token_tracks_latest_heartbeat() {
        let channel = MemoryChannel::new();
        let (manager, _shutdown) = manager(&channel, Arc::new(MemoryTokenStore::default()));
        let creds = manager.credentials();
        let handle = manager.spawn();
        channel.wait_for_subscriptions(1).await;

        for i in 1..=5 {
            channel.emit_heartbeat(Heartbeat::new(format!("tok-{}", i), DeviceStatus::Online));
        }

        let mut rx = creds.rx.clone();
        rx.wait_for(|t| t.as_deref() == Some("tok-5")).await.unwrap();
        assert_eq!(creds.token().unwrap(), "tok-5");
        handle.abort();
    }

    #[tokio::test]
    async fn test_persisted_token_satisfies_init() {
        let channel = MemoryChannel::new();
        let store = Arc::new(MemoryTokenStore::with_token("persisted"));
        let (manager, _shutdown) = manager(&channel, store);
        let creds = manager.credentials();

        assert_eq!(creds.init().await.unwrap(), "persisted");
    }

    #[tokio::test]
    async fn test_fixed_credentials() {
        let creds = Credentials::fixed("static");
        assert_eq!(creds.token().unwrap(), "static");
        assert_eq!(creds.init().await.unwrap(), "static");
    }

    #[tokio::test]
    async fn test_unreadable_store_is_treated_as_absent() {
        let channel = MemoryChannel::new();
        let (manager, _shutdown) = manager(&channel, Arc::new(BrokenStore));
        let creds = manager.credentials();

        let mut init = tokio_test::task::spawn(creds.init());
        tokio_test::assert_pending!(init.poll());

        let handle = manager.spawn();
        channel.wait_for_subscriptions(1).await;
        channel.emit_heartbeat(Heartbeat::new("live", DeviceStatus::Online));

        // Persistence failures do not stop the refresh
        assert_eq!(creds.init().await.unwrap(), "live");
        assert!(init.is_woken());
        handle.abort();
    }

    #[tokio::test]
    async fn test_revocation_raises_shutdown_and_stops() {
        let channel = MemoryChannel::new();
        let (manager, shutdown) = manager(&channel, Arc::new(MemoryTokenStore::default()));
        let handle = manager.spawn();
        channel.wait_for_subscriptions(1).await;

        channel.emit_heartbeat(Heartbeat::new("tok", DeviceStatus::Archived));

        assert_eq!(
            shutdown.wait().await,
            ShutdownReason::DeviceRevoked(DeviceStatus::Archived)
        );
        handle.await.unwrap();
        assert_eq!(channel.subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_is_resubscribed_after_idle_timeout() {
        let idle = Duration::from_secs(30);
        let channel = MemoryChannel::new();
        let (manager, _shutdown) = manager(&channel, Arc::new(MemoryTokenStore::default()));
        let creds = manager.credentials();
        let handle = manager.with_idle_timeout(idle).spawn();
        channel.wait_for_subscriptions(1).await;

        channel.emit_heartbeat(Heartbeat::new("tok-1", DeviceStatus::Online));
        assert_eq!(creds.init().await.unwrap(), "tok-1");

        // The stream stays open but goes quiet
        tokio::time::sleep(idle + RETRY - Duration::from_millis(100)).await;
        assert_eq!(channel.subscriptions(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.subscriptions(), 2);

        channel.emit_heartbeat(Heartbeat::new("tok-2", DeviceStatus::Online));
        while creds.current().as_deref() != Some("tok-2") {
            tokio::task::yield_now().await;
        }
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_first_subscription_does_not_block_forever() {
        let idle = Duration::from_secs(30);
        let channel = MemoryChannel::new();
        let (manager, _shutdown) = manager(&channel, Arc::new(MemoryTokenStore::default()));
        let handle = manager.with_idle_timeout(idle).spawn();
        channel.wait_for_subscriptions(1).await;

        tokio::time::sleep(idle + RETRY + Duration::from_millis(100)).await;
        assert_eq!(channel.subscriptions(), 2);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_once_per_failure_after_delay() {
        let channel = MemoryChannel::new();
        let (manager, _shutdown) = manager(&channel, Arc::new(MemoryTokenStore::default()));
        let handle = manager.spawn();
        channel.wait_for_subscriptions(1).await;

        for attempt in 1..=3 {
            assert!(channel.fail_heartbeat("stream reset"));

            tokio::time::sleep(RETRY - Duration::from_millis(100)).await;
            assert_eq!(channel.subscriptions(), attempt);

            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(channel.subscriptions(), attempt + 1);
        }
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_refused_and_closed_subscriptions() {
        let channel = MemoryChannel::new();
        channel.refuse_subscriptions(1);
        let (manager, _shutdown) = manager(&channel, Arc::new(MemoryTokenStore::default()));
        let creds = manager.credentials();
        let handle = manager.spawn();

        channel.wait_for_subscriptions(2).await;
        channel.close_heartbeat();
        channel.wait_for_subscriptions(3).await;

        channel.emit_heartbeat(Heartbeat::new("after-retry", DeviceStatus::Online));
        assert_eq!(creds.init().await.unwrap(), "after-retry");
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_shutdown_stops_retry_loop() {
        let channel = MemoryChannel::new();
        let (manager, shutdown) = manager(&channel, Arc::new(MemoryTokenStore::default()));
        let handle = manager.spawn();
        channel.wait_for_subscriptions(1).await;
        channel.fail_heartbeat("gone");

        shutdown.trigger(ShutdownReason::DeviceRevoked(DeviceStatus::Deleted));
        handle.await.unwrap();
        assert_eq!(channel.subscriptions(), 1);
    }
}
