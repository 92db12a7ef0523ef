//! The contract a transport driver implements, plus per-subject stats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use super::config::BusInstance;
use crate::error::{InvocationError, TransportError};

// ---------------------------------------------------------------------------
// Driver / Connection traits
// ---------------------------------------------------------------------------

/// Produces connections for bus configs that name it.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Builds an unopened connection for one bus config.
    async fn connect(&self, instance: BusInstance) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An open transport binding.
///
/// Lifecycle: `open` -> `register`* -> `start` -> traffic -> `stop` ->
/// `close`. A connection is created per Open and never reused after Close.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Connects the transport.
    async fn open(&self) -> Result<(), TransportError>;

    /// Disconnects the transport, dropping any subscriptions.
    async fn close(&self) -> Result<(), TransportError>;

    /// Declares a subject base (a service name) to serve once started.
    ///
    /// Fails with [`TransportError::InvalidSubject`] for an empty subject and
    /// [`TransportError::AlreadyRunning`] while subscriptions are active.
    async fn register(&self, subject: &str) -> Result<(), TransportError>;

    /// Activates subscriptions for every registered subject.
    async fn start(&self) -> Result<(), TransportError>;

    /// Deactivates subscriptions.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Sends an encoded request and waits for the encoded reply.
    async fn request(&self, subject: &str, data: Bytes, timeout: Duration) -> Result<Bytes, InvocationError>;

    /// Broadcasts to every subscriber. Returns once submitted.
    async fn publish(&self, subject: &str, data: Bytes) -> Result<(), InvocationError>;

    /// Delivers to one subscriber of the queue group. Returns once submitted.
    async fn enqueue(&self, subject: &str, data: Bytes) -> Result<(), InvocationError>;

    /// Per-subject counters for traffic served by this connection.
    fn stats(&self) -> Vec<ServiceStats>;
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters for one served subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    pub subject: String,
    pub num_requests: u64,
    pub num_errors: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    requests: u64,
    errors: u64,
    latency: Duration,
}

/// Lock-free per-subject counter table shared by a connection's handlers.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    by_subject: DashMap<String, Counters>,
}

impl StatsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one handled message.
    pub fn record(&self, subject: &str, started: Instant, ok: bool) {
        let elapsed = started.elapsed();
        let mut entry = self.by_subject.entry(subject.to_string()).or_default();
        entry.requests += 1;
        if !ok {
            entry.errors += 1;
        }
        entry.latency += elapsed;
    }

    /// Snapshot sorted by subject.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceStats> {
        let mut out: Vec<ServiceStats> = self
            .by_subject
            .iter()
            .map(|entry| {
                let c = *entry.value();
                let total_ms = u64::try_from(c.latency.as_millis()).unwrap_or(u64::MAX);
                #[allow(clippy::cast_precision_loss)]
                let avg = if c.requests == 0 {
                    0.0
                } else {
                    c.latency.as_secs_f64() * 1000.0 / c.requests as f64
                };
                ServiceStats {
                    subject: entry.key().clone(),
                    num_requests: c.requests,
                    num_errors: c.errors,
                    total_latency_ms: total_ms,
                    avg_latency_ms: avg,
                }
            })
            .collect();
        out.sort_by(|a, b| a.subject.cmp(&b.subject));
        out
    }
}
