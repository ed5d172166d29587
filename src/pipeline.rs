//! Interception pipeline
//!
//! Runs the three decision stages for one unit of traffic, strictly in
//! order: connection, request, then (only if both allowed and the
//! application has answered) response. Descriptors are built fresh for each
//! call and always carry the credential current at call time.
//!
//! `admit` and `inspect_response` expose the stages individually for hosts
//! that drive the application themselves; `handle` runs the whole thing
//! and never fails.

use crate::adapter::HostResponse;
use crate::arbiter::{Arbiter, Decision};
use crate::channel::DecisionChannel;
use crate::credential::Credentials;
use crate::error::{GuardError, Result};
use crate::shutdown::ShutdownSignal;
use crate::types::{
    ConnectionDescriptor, FirewallPolicy, InboundRequest, Rejection, RequestDescriptor,
    ResponseDescriptor, ResponseHead, Stage, TcpInfo, Verdict,
};
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;

/// A request that passed the connection and request stages
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    /// Context produced by the connection stage, reused for the response stage
    pub tcp_info: TcpInfo,
}

/// Result of the connection and request stages
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(Admitted),
    Denied(Rejection),
}

/// What to do with the application's response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    /// Deliver it unmodified
    Deliver,
    /// Nothing was committed yet; send this instead
    Replace(Rejection),
    /// Part of it is already on the wire; abort the connection
    Terminate,
}

/// Final disposition of one unit of traffic
#[derive(Debug)]
pub enum Outcome<R> {
    /// Every stage allowed; deliver the application's response
    Forward(R),
    /// A stage denied; send the 401 rejection
    Deny(Rejection),
    /// Abort the underlying connection without a response
    Terminate,
    /// Internal fault; send the 500 rejection
    Fault(Rejection),
}

/// The interception pipeline
///
/// Cheap to clone; clones share the channel and credential cell.
#[derive(Clone)]
pub struct Pipeline {
    channel: Arc<dyn DecisionChannel>,
    credentials: Credentials,
    arbiter: Arbiter,
    shutdown: ShutdownSignal,
}

impl Pipeline {
    pub fn new(
        channel: Arc<dyn DecisionChannel>,
        credentials: Credentials,
        arbiter: Arbiter,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            channel,
            credentials,
            arbiter,
            shutdown,
        }
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    /// Run the connection and request stages
    ///
    /// A DENY at the connection stage short-circuits: the request stage is
    /// never called.
    pub async fn admit(&self, inbound: &InboundRequest) -> Result<Admission> {
        self.ensure_running()?;
        let connection = inbound.connection_info();
        let descriptor = ConnectionDescriptor {
            connection: connection.clone(),
            token: self.credentials.token()?,
        };

        let decision = self
            .decide(
                Stage::Connection,
                self.channel.check_connection(&descriptor),
                |policy| Verdict::new(policy).with_tcp_info(TcpInfo::from_connection(&connection)),
            )
            .await?;

        let verdict = decision.value;
        if !verdict.is_allowed() {
            return Ok(Admission::Denied(Rejection::unauthorized()));
        }
        let tcp_info = verdict
            .tcp_info
            .unwrap_or_else(|| TcpInfo::from_connection(&connection));

        self.ensure_running()?;
        let descriptor = RequestDescriptor {
            original_url: inbound.original_url.clone(),
            method: inbound.method.clone(),
            headers: inbound.headers.clone(),
            body: inbound.body.clone(),
            query: inbound.query.clone(),
            tcp_info: tcp_info.clone(),
            token: self.credentials.token()?,
        };

        let decision = self
            .decide(Stage::Request, self.channel.check_request(&descriptor), Verdict::new)
            .await?;

        if !decision.value.is_allowed() {
            return Ok(Admission::Denied(Rejection::unauthorized()));
        }
        Ok(Admission::Admitted(Admitted { tcp_info }))
    }

    /// Run the response stage for an admitted request
    pub async fn inspect_response(
        &self,
        admitted: &Admitted,
        head: ResponseHead,
    ) -> Result<ResponseAction> {
        self.ensure_running()?;
        let committed = head.committed;
        let descriptor = ResponseDescriptor {
            code: head.status,
            headers: head.headers,
            tcp_info: admitted.tcp_info.clone(),
            token: self.credentials.token()?,
        };

        let decision = self
            .decide(Stage::Response, self.channel.check_response(&descriptor), Verdict::new)
            .await?;

        if decision.value.is_allowed() {
            Ok(ResponseAction::Deliver)
        } else if committed {
            Ok(ResponseAction::Terminate)
        } else {
            Ok(ResponseAction::Replace(Rejection::unauthorized()))
        }
    }

    /// Run all three stages around the application
    ///
    /// `app` is only polled once the request is admitted; on denial it is
    /// dropped unpolled. Faults never escape: they become `Outcome::Fault`,
    /// or `Outcome::Terminate` once shutdown has been raised.
    pub async fn handle<Fut, R>(&self, inbound: InboundRequest, app: Fut) -> Outcome<R>
    where
        Fut: Future<Output = R>,
        R: HostResponse,
    {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "appguard.request",
            request_id = %request_id,
            method = %inbound.method,
            url = %inbound.original_url,
        );

        self.run(inbound, app).instrument(span).await
    }

    async fn run<Fut, R>(&self, inbound: InboundRequest, app: Fut) -> Outcome<R>
    where
        Fut: Future<Output = R>,
        R: HostResponse,
    {
        let admitted = match self.admit(&inbound).await {
            Ok(Admission::Admitted(admitted)) => admitted,
            Ok(Admission::Denied(rejection)) => {
                tracing::info!(status = rejection.status, "Request denied");
                return Outcome::Deny(rejection);
            }
            Err(e) => return fault(e),
        };

        // Revocation may have landed while the request stage was settling
        if let Err(e) = self.ensure_running() {
            return fault(e);
        }
        let response = app.await;

        match self.inspect_response(&admitted, response.head()).await {
            Ok(ResponseAction::Deliver) => Outcome::Forward(response),
            Ok(ResponseAction::Replace(rejection)) => {
                tracing::info!(status = rejection.status, "Response denied, replacing it");
                Outcome::Deny(rejection)
            }
            Ok(ResponseAction::Terminate) => {
                tracing::warn!("Response denied after commit, terminating connection");
                Outcome::Terminate
            }
            Err(e) => fault(e),
        }
    }

    /// Arbitrate one stage, abandoning it if shutdown is raised meanwhile
    ///
    /// The pending call is dropped on shutdown, so a verdict arriving after
    /// revocation is never acted on.
    async fn decide<F>(
        &self,
        stage: Stage,
        call: F,
        fallback: impl FnOnce(FirewallPolicy) -> Verdict,
    ) -> Result<Decision<Verdict>>
    where
        F: Future<Output = Result<Verdict>>,
    {
        let decision = tokio::select! {
            biased;
            reason = self.shutdown.wait() => return Err(reason.into()),
            decision = self.arbiter.arbitrate(stage, call, fallback) => decision,
        };
        trace_decision(stage, &decision);
        Ok(decision)
    }

    fn ensure_running(&self) -> Result<()> {
        match self.shutdown.reason() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }
}

fn trace_decision(stage: Stage, decision: &Decision<Verdict>) {
    tracing::debug!(
        stage = %stage,
        policy = %decision.value.policy,
        source = ?decision.source,
        "Verdict"
    );
}

fn fault<R>(error: GuardError) -> Outcome<R> {
    match error {
        GuardError::DeviceRevoked(status) => {
            tracing::debug!(status = %status, "Shutdown raised, dropping request");
            Outcome::Terminate
        }
        e => {
            tracing::error!(error = %e, "Internal fault in interception pipeline");
            Outcome::Fault(Rejection::internal_error())
        }
    }
}
