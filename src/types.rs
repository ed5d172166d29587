//! Core types exchanged with the AppGuard decision service
//!
//! All wire types use camelCase JSON serialization. Descriptors are built
//! fresh for every unit of traffic and never cached across stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Policy outcome of a decision call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirewallPolicy {
    /// Let the traffic through
    #[default]
    #[serde(alias = "allow")]
    Allow,
    /// Reject the traffic
    #[serde(alias = "deny")]
    Deny,
}

impl fmt::Display for FirewallPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Deny => write!(f, "DENY"),
        }
    }
}

/// The three decision stages, always run in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Connection,
    Request,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Addressing data of one inbound connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Client address, taken from trusted-proxy headers when present
    pub source_ip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,

    /// Application protocol as seen by the host (e.g. "http", "https")
    pub protocol: String,
}

/// Connection-stage descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    #[serde(flatten)]
    pub connection: ConnectionInfo,

    /// Session credential current at call time
    pub token: String,
}

/// Connection-identifying context produced by the connection stage
///
/// Any fields the remote service adds beyond the connection itself are
/// kept verbatim in `details` and threaded into later stages unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpInfo {
    pub connection: ConnectionInfo,

    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl TcpInfo {
    /// Derive a context from the raw connection, without remote details
    pub fn from_connection(connection: &ConnectionInfo) -> Self {
        Self {
            connection: connection.clone(),
            details: serde_json::Map::new(),
        }
    }
}

/// Request-stage descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    /// Path plus query string as received
    pub original_url: String,

    pub method: String,

    /// Header names as delivered by the host; case handling is left to the service
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(default)]
    pub query: HashMap<String, String>,

    pub tcp_info: TcpInfo,

    pub token: String,
}

/// Response-stage descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDescriptor {
    /// HTTP status code emitted by the application
    pub code: u16,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    pub tcp_info: TcpInfo,

    pub token: String,
}

/// Outcome of one decision call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub policy: FirewallPolicy,

    /// Only produced by the connection stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<TcpInfo>,
}

impl Verdict {
    pub fn new(policy: FirewallPolicy) -> Self {
        Self {
            policy,
            tcp_info: None,
        }
    }

    pub fn allow() -> Self {
        Self::new(FirewallPolicy::Allow)
    }

    pub fn deny() -> Self {
        Self::new(FirewallPolicy::Deny)
    }

    /// Attach a TCP context
    pub fn with_tcp_info(mut self, tcp_info: TcpInfo) -> Self {
        self.tcp_info = Some(tcp_info);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.policy == FirewallPolicy::Allow
    }
}

/// Lifecycle state of this device as tracked by the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Archived,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl DeviceStatus {
    /// Archived and deleted devices may not authorize any further traffic
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Deleted)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Archived => "ARCHIVED",
            Self::Deleted => "DELETED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One event on the heartbeat subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Fresh session credential
    pub token: String,
    pub status: DeviceStatus,
}

impl Heartbeat {
    pub fn new(token: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            token: token.into(),
            status,
        }
    }
}

/// Identity this instance presents when opening the heartbeat subscription
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub app_id: String,
    pub app_secret: String,
}

impl DeviceIdentity {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
        }
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("app_id", &self.app_id)
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}

/// Startup ruleset push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallUpdate {
    pub token: String,
    /// Opaque ruleset text, never inspected locally
    pub firewall: String,
}

/// Acknowledgement of a ruleset push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAck {
    pub accepted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PolicyAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: Some(message.into()),
        }
    }
}

/// A single application log line shipped to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Serialized as RFC 3339
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// A batch of log lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatch {
    pub token: String,
    pub logs: Vec<LogEntry>,
}

/// Transport metadata of an inbound unit of traffic, as reported by the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Socket-level client address
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub local_ip: Option<String>,
    pub local_port: Option<u16>,
    pub protocol: String,
}

/// Host-neutral view of one inbound HTTP request
///
/// Hosting adapters fill this from their native request type; the pipeline
/// turns it into descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub peer: PeerInfo,
    pub method: String,
    /// Path plus query string
    pub original_url: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Text body; adapters leave this empty for bodies that are not UTF-8
    pub body: Option<String>,
}

impl InboundRequest {
    /// Resolve the client address: `x-real-ip`, then the first
    /// `x-forwarded-for` hop, then the raw socket address.
    pub fn source_ip(&self) -> String {
        let header = |name: &str| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        if let Some(ip) = header("x-real-ip").map(str::trim).filter(|v| !v.is_empty()) {
            return ip.to_string();
        }

        if let Some(ip) = header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return ip.to_string();
        }

        self.peer.remote_ip.clone().unwrap_or_default()
    }

    /// Connection addressing derived from this request
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            source_ip: self.source_ip(),
            source_port: self.peer.remote_port,
            destination_ip: self.peer.local_ip.clone(),
            destination_port: self.peer.local_port,
            protocol: self.peer.protocol.clone(),
        }
    }
}

/// Status and headers of an application response, before delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// True once any part of the response has been written to the client
    pub committed: bool,
}

/// Standard rejection produced by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub status: u16,
    pub body: RejectionBody,
}

/// JSON body of a rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub success: bool,
    pub message: String,
}

impl Rejection {
    /// 401 returned when any stage denies
    pub fn unauthorized() -> Self {
        Self {
            status: 401,
            body: RejectionBody {
                success: false,
                message: "Unauthorized".to_string(),
            },
        }
    }

    /// 500 returned on an internal fault
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            body: RejectionBody {
                success: false,
                message: "Internal server error".to_string(),
            },
        }
    }
}
