//! # Metrics
//!
//! Server-level counters, shared across connection tasks. The engine keeps
//! its own plain-struct stats since it is single-owner; these atomics cover
//! the parts of the server that run concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    active_connections: AtomicU64,
    commands: AtomicU64,
    rejected_requests: AtomicU64,
    request_bytes: AtomicU64,
    slowlog_entries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                connections_accepted: AtomicU64::new(0),
                connections_rejected: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
                commands: AtomicU64::new(0),
                rejected_requests: AtomicU64::new(0),
                request_bytes: AtomicU64::new(0),
                slowlog_entries: AtomicU64::new(0),
            }),
        }
    }

    pub fn connection_opened(&self) {
        self.inner.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.inner.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self, request_bytes: u64) {
        self.inner.commands.fetch_add(1, Ordering::Relaxed);
        self.inner.request_bytes.fetch_add(request_bytes, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.inner.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slowlog(&self) {
        self.inner.slowlog_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.inner.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.inner.connections_rejected.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            commands: self.inner.commands.load(Ordering::Relaxed),
            rejected_requests: self.inner.rejected_requests.load(Ordering::Relaxed),
            request_bytes: self.inner.request_bytes.load(Ordering::Relaxed),
            slowlog_entries: self.inner.slowlog_entries.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub active_connections: u64,
    pub commands: u64,
    pub rejected_requests: u64,
    pub request_bytes: u64,
    pub slowlog_entries: u64,
}

impl MetricsSnapshot {
    /// Mean request size in bytes, zero when nothing was recorded.
    pub fn avg_request_bytes(&self) -> f64 {
        if self.commands == 0 {
            0.0
        } else {
            self.request_bytes as f64 / self.commands as f64
        }
    }
}
