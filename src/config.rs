//! Gatekeeper configuration

use crate::error::{GuardError, Result};
use crate::types::FirewallPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one gatekeeper instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardConfig {
    /// Decision service host
    pub host: String,

    /// Decision service port
    pub port: u16,

    /// Require an encrypted channel
    pub tls: bool,

    /// Verdict used when a decision call does not settle in time
    pub default_policy: FirewallPolicy,

    /// Per-call timeout in milliseconds; `None` disables racing entirely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Opaque ruleset pushed once at startup
    pub firewall: String,

    /// Deadline for the channel to become ready at startup
    pub ready_timeout_secs: u64,

    /// Delay before resubscribing after the heartbeat stream fails
    pub heartbeat_retry_secs: u64,

    /// Longest silence tolerated on the heartbeat stream before resubscribing
    pub heartbeat_idle_secs: u64,

    /// Subject namespace on the decision channel
    pub subject_prefix: String,

    /// Where the latest credential is persisted; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4222,
            tls: false,
            default_policy: FirewallPolicy::Allow,
            timeout: None,
            firewall: "[]".to_string(),
            ready_timeout_secs: 10,
            heartbeat_retry_secs: 10,
            heartbeat_idle_secs: 60,
            subject_prefix: "appguard".to_string(),
            token_path: None,
        }
    }
}

impl GuardConfig {
    /// Check that the configuration can be used to start a gatekeeper
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(GuardError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(GuardError::Config("port must be non-zero".to_string()));
        }
        if self.timeout == Some(0) {
            return Err(GuardError::Config(
                "timeout must be positive when set".to_string(),
            ));
        }
        if self.ready_timeout_secs == 0 {
            return Err(GuardError::Config(
                "readyTimeoutSecs must be positive".to_string(),
            ));
        }
        if self.heartbeat_retry_secs == 0 {
            return Err(GuardError::Config(
                "heartbeatRetrySecs must be positive".to_string(),
            ));
        }
        if self.heartbeat_idle_secs == 0 {
            return Err(GuardError::Config(
                "heartbeatIdleSecs must be positive".to_string(),
            ));
        }
        if self.subject_prefix.trim().is_empty() {
            return Err(GuardError::Config(
                "subjectPrefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Decision call timeout, if racing is enabled
    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn heartbeat_retry(&self) -> Duration {
        Duration::from_secs(self.heartbeat_retry_secs)
    }

    pub fn heartbeat_idle(&self) -> Duration {
        Duration::from_secs(self.heartbeat_idle_secs)
    }

    /// Server URL for the channel, with the scheme chosen by `tls`
    pub fn server_url(&self) -> String {
        let scheme = if self.tls { "tls" } else { "nats" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Build a full subject for a channel operation
    pub fn subject(&self, operation: &str) -> String {
        format!("{}.{}", self.subject_prefix, operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.default_policy, FirewallPolicy::Allow);
        assert!(config.call_timeout().is_none());
        assert_eq!(config.ready_timeout(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_retry(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_idle(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let config: GuardConfig = serde_json::from_value(serde_json::json!({
            "host": "guard.internal",
            "port": 50051,
            "tls": true,
            "defaultPolicy": "DENY",
            "timeout": 1000,
            "firewall": "[{\"policy\": \"deny\"}]"
        }))
        .unwrap();

        assert_eq!(config.host, "guard.internal");
        assert_eq!(config.default_policy, FirewallPolicy::Deny);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(1000)));
        assert_eq!(config.server_url(), "tls://guard.internal:50051");
        // Unspecified fields keep their defaults
        assert_eq!(config.subject_prefix, "appguard");
        assert_eq!(config.ready_timeout_secs, 10);
    }

    #[test]
    fn test_subject() {
        let config = GuardConfig {
            subject_prefix: "edge.guard".to_string(),
            ..Default::default()
        };
        assert_eq!(config.subject("http_request"), "edge.guard.http_request");
        assert_eq!(config.server_url(), "nats://localhost:4222");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            GuardConfig { host: " ".to_string(), ..Default::default() },
            GuardConfig { port: 0, ..Default::default() },
            GuardConfig { timeout: Some(0), ..Default::default() },
            GuardConfig { ready_timeout_secs: 0, ..Default::default() },
            GuardConfig { heartbeat_retry_secs: 0, ..Default::default() },
            GuardConfig { heartbeat_idle_secs: 0, ..Default::default() },
            GuardConfig { subject_prefix: String::new(), ..Default::default() },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(GuardError::Config(_))));
        }
    }
}
