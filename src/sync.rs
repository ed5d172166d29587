//! Startup ruleset push
//!
//! Runs exactly once, after the channel is ready and the first credential
//! has arrived. A failed or unacknowledged push is fatal: nothing may be
//! served against a service that never installed our ruleset.

use crate::channel::DecisionChannel;
use crate::credential::Credentials;
use crate::error::{GuardError, Result};
use crate::types::{FirewallUpdate, PolicyAck};

/// Push the configured ruleset with the current credential
///
/// Waits for the first credential if none is cached yet.
pub async fn sync_policy(
    channel: &dyn DecisionChannel,
    credentials: &Credentials,
    firewall: &str,
) -> Result<PolicyAck> {
    let token = credentials.init().await?;
    let update = FirewallUpdate {
        token,
        firewall: firewall.to_string(),
    };

    let ack = channel.push_policy(&update).await.map_err(|e| match e {
        GuardError::PolicyPush(_) => e,
        other => GuardError::PolicyPush(other.to_string()),
    })?;

    if !ack.accepted {
        return Err(GuardError::PolicyPush(
            ack.message
                .unwrap_or_else(|| "ruleset rejected by service".to_string()),
        ));
    }

    tracing::info!(
        backend = channel.name(),
        ruleset_bytes = firewall.len(),
        "Firewall policy installed"
    );
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::{MemoryChannel, Reply};
    use crate::credential::CredentialManager;
    use crate::shutdown::ShutdownSignal;
    use crate::state::MemoryTokenStore;
    use crate::types::DeviceIdentity;
    use std::sync::Arc;
    use std::time::Duration;

    fn credentials(channel: &MemoryChannel, token: &str) -> Credentials {
        CredentialManager::new(
            Arc::new(channel.clone()),
            DeviceIdentity::new("app", "secret"),
            Arc::new(MemoryTokenStore::with_token(token)),
            ShutdownSignal::new(),
            Duration::from_secs(10),
        )
        .credentials()
    }

    #[tokio::test]
    async fn test_pushes_ruleset_with_current_token() {
        let channel = MemoryChannel::new();
        let creds = credentials(&channel, "tok-1");

        let ack = sync_policy(&channel, &creds, r#"[{"rule":"deny-php"}]"#)
            .await
            .unwrap();
        assert!(ack.accepted);

        let pushes = channel.calls().pushes;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].token, "tok-1");
        assert_eq!(pushes[0].firewall, r#"[{"rule":"deny-php"}]"#);
    }

    #[tokio::test]
    async fn test_rejected_ack_is_fatal() {
        let channel = MemoryChannel::new();
        channel.on_firewall(|_| Reply::Respond(PolicyAck::rejected("bad ruleset")));
        let creds = credentials(&channel, "tok");

        let err = sync_policy(&channel, &creds, "not json").await.unwrap_err();
        assert!(matches!(err, GuardError::PolicyPush(ref m) if m == "bad ruleset"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal() {
        let channel = MemoryChannel::new();
        channel.on_firewall(|_| Reply::Fail("no responders".to_string()));
        let creds = credentials(&channel, "tok");

        let err = sync_policy(&channel, &creds, "[]").await.unwrap_err();
        assert!(matches!(err, GuardError::PolicyPush(_)));
    }
}
