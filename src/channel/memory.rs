//! In-memory decision channel
//!
//! A scriptable, in-process `DecisionChannel` for tests, benchmarks and
//! embedding without a running decision service. Every stage answers
//! according to a replaceable script, every call is recorded, and the
//! heartbeat feed is driven by hand.

use crate::channel::{DecisionChannel, HeartbeatStream};
use crate::error::{GuardError, Result};
use crate::types::{
    ConnectionDescriptor, DeviceIdentity, FirewallUpdate, Heartbeat, LogBatch, PolicyAck,
    RequestDescriptor, ResponseDescriptor, Stage, TcpInfo, Verdict,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// Scripted answer to one call
#[derive(Debug, Clone)]
pub enum Reply<T> {
    /// Answer immediately
    Respond(T),
    /// Answer after a delay
    Delay(Duration, T),
    /// Fail with a transport error
    Fail(String),
    /// Never answer
    Hang,
}

type Script<D, T> = Arc<dyn Fn(&D) -> Reply<T> + Send + Sync>;

enum FeedItem {
    Beat(Heartbeat),
    Fail(String),
}

/// Descriptors received so far, in arrival order
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub connections: Vec<ConnectionDescriptor>,
    pub requests: Vec<RequestDescriptor>,
    pub responses: Vec<ResponseDescriptor>,
    pub pushes: Vec<FirewallUpdate>,
}

impl CallLog {
    /// Number of calls made for a stage
    pub fn count(&self, stage: Stage) -> usize {
        match stage {
            Stage::Connection => self.connections.len(),
            Stage::Request => self.requests.len(),
            Stage::Response => self.responses.len(),
        }
    }
}

struct Inner {
    connection: RwLock<Script<ConnectionDescriptor, Verdict>>,
    request: RwLock<Script<RequestDescriptor, Verdict>>,
    response: RwLock<Script<ResponseDescriptor, Verdict>>,
    firewall: RwLock<Script<FirewallUpdate, PolicyAck>>,
    calls: Mutex<CallLog>,
    in_flight: AtomicUsize,
    feed: Mutex<Option<mpsc::UnboundedSender<FeedItem>>>,
    subscriptions: watch::Sender<usize>,
    refused_subscriptions: AtomicUsize,
    logs: Mutex<Vec<LogBatch>>,
    fail_logs: AtomicBool,
}

/// In-memory decision channel
///
/// Cheap to clone; clones share scripts, call records and the heartbeat feed.
/// By default every stage allows, the connection stage derives its TCP
/// context from the descriptor, and ruleset pushes are accepted.
#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        let (subscriptions, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                connection: RwLock::new(Arc::new(|d: &ConnectionDescriptor| {
                    Reply::Respond(
                        Verdict::allow().with_tcp_info(TcpInfo::from_connection(&d.connection)),
                    )
                })),
                request: RwLock::new(Arc::new(|_: &RequestDescriptor| {
                    Reply::Respond(Verdict::allow())
                })),
                response: RwLock::new(Arc::new(|_: &ResponseDescriptor| {
                    Reply::Respond(Verdict::allow())
                })),
                firewall: RwLock::new(Arc::new(|_: &FirewallUpdate| {
                    Reply::Respond(PolicyAck::accepted())
                })),
                calls: Mutex::new(CallLog::default()),
                in_flight: AtomicUsize::new(0),
                feed: Mutex::new(None),
                subscriptions,
                refused_subscriptions: AtomicUsize::new(0),
                logs: Mutex::new(Vec::new()),
                fail_logs: AtomicBool::new(false),
            }),
        }
    }

    /// Script the connection stage
    pub fn on_connection(
        &self,
        script: impl Fn(&ConnectionDescriptor) -> Reply<Verdict> + Send + Sync + 'static,
    ) {
        *write(&self.inner.connection) = Arc::new(script);
    }

    /// Script the request stage
    pub fn on_request(
        &self,
        script: impl Fn(&RequestDescriptor) -> Reply<Verdict> + Send + Sync + 'static,
    ) {
        *write(&self.inner.request) = Arc::new(script);
    }

    /// Script the response stage
    pub fn on_response(
        &self,
        script: impl Fn(&ResponseDescriptor) -> Reply<Verdict> + Send + Sync + 'static,
    ) {
        *write(&self.inner.response) = Arc::new(script);
    }

    /// Script ruleset pushes
    pub fn on_firewall(
        &self,
        script: impl Fn(&FirewallUpdate) -> Reply<PolicyAck> + Send + Sync + 'static,
    ) {
        *write(&self.inner.firewall) = Arc::new(script);
    }

    /// Snapshot of all recorded calls
    pub fn calls(&self) -> CallLog {
        lock(&self.inner.calls).clone()
    }

    /// Calls currently awaiting their scripted answer
    ///
    /// A call whose future is dropped before it settles leaves this count.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Number of heartbeat subscriptions opened so far
    pub fn subscriptions(&self) -> usize {
        *self.inner.subscriptions.borrow()
    }

    /// Wait until at least `count` heartbeat subscriptions have been opened
    pub async fn wait_for_subscriptions(&self, count: usize) {
        let mut rx = self.inner.subscriptions.subscribe();
        // The sender lives in `inner`, which outlives this borrow.
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Make the next `count` subscribe attempts fail
    pub fn refuse_subscriptions(&self, count: usize) {
        self.inner
            .refused_subscriptions
            .store(count, Ordering::SeqCst);
    }

    /// Deliver a heartbeat on the live subscription
    ///
    /// Returns false if no subscription is currently open.
    pub fn emit_heartbeat(&self, heartbeat: Heartbeat) -> bool {
        self.feed(FeedItem::Beat(heartbeat))
    }

    /// Break the live subscription with an error
    pub fn fail_heartbeat(&self, reason: impl Into<String>) -> bool {
        self.feed(FeedItem::Fail(reason.into()))
    }

    /// End the live subscription cleanly
    pub fn close_heartbeat(&self) {
        lock(&self.inner.feed).take();
    }

    /// Log batches received so far
    pub fn logs(&self) -> Vec<LogBatch> {
        lock(&self.inner.logs).clone()
    }

    /// Make log shipping fail (or succeed again)
    pub fn fail_logs(&self, fail: bool) {
        self.inner.fail_logs.store(fail, Ordering::SeqCst);
    }

    fn feed(&self, item: FeedItem) -> bool {
        match lock(&self.inner.feed).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    fn enter(&self) -> InFlight {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(self.inner.clone())
    }
}

/// Decrements the in-flight count when the call settles or is dropped
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn play<T>(reply: Reply<T>, on_error: impl Fn(String) -> GuardError) -> Result<T> {
    match reply {
        Reply::Respond(value) => Ok(value),
        Reply::Delay(delay, value) => {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
        Reply::Fail(reason) => Err(on_error(reason)),
        Reply::Hang => futures::future::pending().await,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

fn script<T: Clone>(l: &RwLock<T>) -> T {
    l.read().unwrap_or_else(PoisonError::into_inner).clone()
}

#[async_trait]
impl DecisionChannel for MemoryChannel {
    async fn check_connection(&self, connection: &ConnectionDescriptor) -> Result<Verdict> {
        let _guard = self.enter();
        lock(&self.inner.calls).connections.push(connection.clone());
        let reply = script(&self.inner.connection)(connection);
        play(reply, |r| GuardError::transport(Stage::Connection, r)).await
    }

    async fn check_request(&self, request: &RequestDescriptor) -> Result<Verdict> {
        let _guard = self.enter();
        lock(&self.inner.calls).requests.push(request.clone());
        let reply = script(&self.inner.request)(request);
        play(reply, |r| GuardError::transport(Stage::Request, r)).await
    }

    async fn check_response(&self, response: &ResponseDescriptor) -> Result<Verdict> {
        let _guard = self.enter();
        lock(&self.inner.calls).responses.push(response.clone());
        let reply = script(&self.inner.response)(response);
        play(reply, |r| GuardError::transport(Stage::Response, r)).await
    }

    async fn push_policy(&self, update: &FirewallUpdate) -> Result<PolicyAck> {
        let _guard = self.enter();
        lock(&self.inner.calls).pushes.push(update.clone());
        let reply = script(&self.inner.firewall)(update);
        play(reply, GuardError::PolicyPush).await
    }

    async fn subscribe_heartbeat(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Box<dyn HeartbeatStream>> {
        let refused = self
            .inner
            .refused_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            self.inner.subscriptions.send_modify(|n| *n += 1);
            return Err(GuardError::Subscribe(format!(
                "subscription refused for {}",
                identity.app_id
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.feed) = Some(tx);
        // Counted only once the feed is live, so waiters can emit right away
        self.inner.subscriptions.send_modify(|n| *n += 1);
        Ok(Box::new(MemoryHeartbeatStream {
            stream: UnboundedReceiverStream::new(rx),
        }))
    }

    async fn send_logs(&self, batch: &LogBatch) -> Result<()> {
        if self.inner.fail_logs.load(Ordering::SeqCst) {
            return Err(GuardError::Connection("log sink unavailable".to_string()));
        }
        lock(&self.inner.logs).push(batch.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Heartbeat stream fed by `MemoryChannel`
pub struct MemoryHeartbeatStream {
    stream: UnboundedReceiverStream<FeedItem>,
}

#[async_trait]
impl HeartbeatStream for MemoryHeartbeatStream {
    async fn next(&mut self) -> Result<Option<Heartbeat>> {
        match self.stream.next().await {
            Some(FeedItem::Beat(heartbeat)) => Ok(Some(heartbeat)),
            Some(FeedItem::Fail(reason)) => Err(GuardError::Subscribe(reason)),
            None => Ok(None),
        }
    }
}
