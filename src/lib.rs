//! # appguard
//!
//! Inline gatekeeper that delegates every allow/deny decision for inbound
//! HTTP traffic to a remote AppGuard decision service.
//!
//! ## Overview
//!
//! Each request passes three decision stages (connection, request,
//! response), each answered by the remote service over a long-lived
//! decision channel. Calls race an optional timeout that falls back to a
//! configured default policy. A background task keeps the session
//! credential fresh from a heartbeat subscription, and the configured
//! ruleset is pushed once before any traffic is served.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use appguard::{AppGuard, DeviceIdentity, GuardConfig};
//! use appguard::adapter::axum::{protect, PeerAddrs};
//! use axum::{routing::get, Router};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GuardConfig {
//!     host: "appguard.internal".to_string(),
//!     timeout: Some(1000),
//!     ..Default::default()
//! };
//! let guard = AppGuard::connect(config, DeviceIdentity::new("app-id", "app-secret")).await?;
//!
//! let app = protect(Router::new().route("/", get(|| async { "hello" })), guard.pipeline());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!
//! let shutdown = guard.shutdown().clone();
//! axum::serve(listener, app.into_make_service_with_connect_info::<PeerAddrs>())
//!     .with_graceful_shutdown(async move {
//!         shutdown.wait().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Channels
//!
//! - **nats**: NATS request/reply with JSON payloads
//! - **memory**: scriptable in-process channel for tests and embedding
//!
//! ## Architecture
//!
//! - **DecisionChannel** trait: connection to the decision service
//! - **CredentialManager**: heartbeat-driven session credential
//! - **Arbiter**: first-of-two race between a call and the timeout
//! - **Pipeline**: the three-stage check for one unit of traffic
//! - **AppGuard**: startup ordering; hands out the live pipeline
//! - **ShutdownSignal**: raised on device revocation, observed by the host

pub mod adapter;
pub mod arbiter;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod guard;
pub mod logs;
pub mod pipeline;
pub mod shutdown;
pub mod state;
pub mod sync;
pub mod types;

// Re-export core types
pub use arbiter::{Arbiter, Decision, DecisionSource};
pub use channel::{DecisionChannel, HeartbeatStream};
pub use config::GuardConfig;
pub use credential::{CredentialManager, Credentials};
pub use error::{GuardError, Result};
pub use guard::AppGuard;
pub use logs::{LogShipper, RemoteLogLayer};
pub use pipeline::{Admission, Admitted, Outcome, Pipeline, ResponseAction};
pub use shutdown::{ShutdownReason, ShutdownSignal};
pub use state::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use sync::sync_policy;
pub use types::{
    ConnectionDescriptor, ConnectionInfo, DeviceIdentity, DeviceStatus, FirewallPolicy,
    FirewallUpdate, Heartbeat, InboundRequest, PeerInfo, PolicyAck, Rejection,
    RequestDescriptor, ResponseDescriptor, ResponseHead, Stage, TcpInfo, Verdict,
};

// Re-export channels for convenience
pub use channel::memory::{MemoryChannel, Reply};
pub use channel::nats::{NatsChannel, NatsClient};
