//! Remote log shipping
//!
//! `RemoteLogLayer` plugs into the host's `tracing` subscriber and copies
//! application events into a bounded queue. `LogShipper` drains that queue
//! in batches and sends them over the decision channel with the current
//! credential. Events from this crate and from the NATS client are never
//! captured, so shipping cannot feed itself.
//!
//! ```rust,no_run
//! # use appguard::{AppGuard, GuardConfig, DeviceIdentity};
//! # async fn example() -> appguard::Result<()> {
//! use tracing_subscriber::prelude::*;
//!
//! let mut guard = AppGuard::connect(GuardConfig::default(), DeviceIdentity::new("app", "secret")).await?;
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(guard.remote_logs())
//!     .init();
//! # Ok(())
//! # }
//! ```

use crate::channel::DecisionChannel;
use crate::credential::Credentials;
use crate::shutdown::ShutdownSignal;
use crate::types::{LogBatch, LogEntry};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Default number of entries the queue holds before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of entries per batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default time a partial batch waits before being sent
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Targets whose events are never shipped
const SKIPPED_TARGETS: &[&str] = &["appguard", "async_nats"];

fn is_skipped(target: &str) -> bool {
    SKIPPED_TARGETS.iter().any(|skipped| {
        target == *skipped
            || target
                .strip_prefix(skipped)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}

/// `tracing` layer feeding the log shipper
#[derive(Clone)]
pub struct RemoteLogLayer {
    tx: mpsc::Sender<LogEntry>,
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_skipped(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let entry = LogEntry {
            timestamp: chrono::Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        };

        // Full or closed queue: the entry is dropped
        let _ = self.tx.try_send(entry);
    }
}

/// Renders the `message` field followed by the remaining fields as `k=v`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }
}

enum Step {
    Entry(LogEntry),
    Flush,
    Stop,
}

/// Background task shipping captured log entries
pub struct LogShipper {
    channel: Arc<dyn DecisionChannel>,
    credentials: Credentials,
    shutdown: ShutdownSignal,
    rx: mpsc::Receiver<LogEntry>,
    capacity: usize,
    batch_size: usize,
    flush_interval: Duration,
}

impl LogShipper {
    /// Create a shipper and the layer that feeds it
    pub fn new(
        channel: Arc<dyn DecisionChannel>,
        credentials: Credentials,
        shutdown: ShutdownSignal,
    ) -> (RemoteLogLayer, Self) {
        Self::with_capacity(channel, credentials, shutdown, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        channel: Arc<dyn DecisionChannel>,
        credentials: Credentials,
        shutdown: ShutdownSignal,
        capacity: usize,
    ) -> (RemoteLogLayer, Self) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shipper = Self {
            channel,
            credentials,
            shutdown,
            rx,
            capacity,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        };
        (RemoteLogLayer { tx }, shipper)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval.max(Duration::from_millis(1));
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Ship until shutdown is raised or every layer is dropped, then flush
    /// whatever is left
    pub async fn run(mut self) {
        let mut buffer = Vec::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.wait() => Step::Stop,
                entry = self.rx.recv() => match entry {
                    Some(entry) => Step::Entry(entry),
                    None => Step::Stop,
                },
                _ = ticker.tick() => Step::Flush,
            };

            match step {
                Step::Entry(entry) => {
                    buffer.push(entry);
                    if buffer.len() >= self.batch_size {
                        self.flush(&mut buffer).await;
                    }
                }
                Step::Flush => self.flush(&mut buffer).await,
                Step::Stop => {
                    while let Ok(entry) = self.rx.try_recv() {
                        buffer.push(entry);
                    }
                    self.flush(&mut buffer).await;
                    return;
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<LogEntry>) {
        if buffer.is_empty() {
            return;
        }

        let token = match self.credentials.token() {
            Ok(token) => token,
            Err(_) => {
                // Keep waiting for a credential, but never hold more than
                // one queue's worth
                if buffer.len() > self.capacity {
                    let excess = buffer.len() - self.capacity;
                    buffer.drain(..excess);
                    tracing::warn!(dropped = excess, "No credential yet, dropping oldest logs");
                }
                return;
            }
        };

        let batch = LogBatch {
            token,
            logs: std::mem::take(buffer),
        };
        let count = batch.logs.len();

        match self.channel.send_logs(&batch).await {
            Ok(()) => tracing::debug!(count, "Shipped log batch"),
            Err(e) => tracing::warn!(error = %e, dropped = count, "Failed to ship log batch"),
        }
    }
}
