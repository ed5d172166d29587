//! Timeout arbitration for decision calls
//!
//! Every decision call races a timer that yields the default policy. The
//! first to settle wins; the loser is dropped on the spot, which cancels
//! the remote call instead of leaving it running in the background.

use crate::error::Result;
use crate::types::{FirewallPolicy, Stage};
use std::future::Future;
use std::time::Duration;

/// Where an effective verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// The remote service answered
    Remote,
    /// The timer fired first
    TimedOut,
    /// The call failed before the timer fired
    TransportFailed,
}

/// Effective result of one arbitrated call
#[derive(Debug, Clone, PartialEq)]
pub struct Decision<T> {
    pub value: T,
    pub source: DecisionSource,
}

impl<T> Decision<T> {
    /// True unless the remote service itself produced the value
    pub fn is_fallback(&self) -> bool {
        self.source != DecisionSource::Remote
    }
}

/// Races decision calls against the configured timeout
#[derive(Debug, Clone, Copy)]
pub struct Arbiter {
    default_policy: FirewallPolicy,
    timeout: Option<Duration>,
}

impl Arbiter {
    pub fn new(default_policy: FirewallPolicy, timeout: Option<Duration>) -> Self {
        Self {
            default_policy,
            timeout,
        }
    }

    pub fn default_policy(&self) -> FirewallPolicy {
        self.default_policy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolve `call` into a decision
    ///
    /// With no timeout the call is awaited until it settles. A transport
    /// failure falls back exactly like a timeout does. `fallback` receives
    /// the default policy and builds the substitute value.
    pub async fn arbitrate<T, F>(
        &self,
        stage: Stage,
        call: F,
        fallback: impl FnOnce(FirewallPolicy) -> T,
    ) -> Decision<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = match self.timeout {
            None => Some(call.await),
            Some(timeout) => {
                tokio::select! {
                    biased;
                    result = call => Some(result),
                    _ = tokio::time::sleep(timeout) => None,
                }
            }
        };

        match outcome {
            Some(Ok(value)) => Decision {
                value,
                source: DecisionSource::Remote,
            },
            Some(Err(e)) => {
                tracing::warn!(
                    stage = %stage,
                    error = %e,
                    default_policy = %self.default_policy,
                    "Decision call failed, applying default policy"
                );
                Decision {
                    value: fallback(self.default_policy),
                    source: DecisionSource::TransportFailed,
                }
            }
            None => {
                tracing::debug!(
                    stage = %stage,
                    timeout_ms = self.timeout.map(|t| t.as_millis() as u64),
                    default_policy = %self.default_policy,
                    "Decision call timed out, applying default policy"
                );
                Decision {
                    value: fallback(self.default_policy),
                    source: DecisionSource::TimedOut,
                }
            }
        }
    }
}
