//! Operational counters.
//!
//! Aggregates only; no peer addresses or payload data are ever recorded.
//! These double as the observable hooks for silent-drop behavior: a replayed
//! or undecipherable packet increments `open_failures` and nothing else.
//! Counters that belong to one component's state live with that component
//! instead (replay rejections on the envelope cipher, delivery-queue drops on
//! each ARQ connection).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics collector.
pub struct ServerMetrics {
    start_time: Instant,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    open_failures: AtomicU64,
    worker_drops: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_active: AtomicU64,
    targets_opened: AtomicU64,
    targets_active: AtomicU64,
    streams_opened: AtomicU64,
    streams_active: AtomicU64,
}

impl ServerMetrics {
    /// Create a zeroed collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
            worker_drops: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            targets_opened: AtomicU64::new(0),
            targets_active: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_active: AtomicU64::new(0),
        }
    }

    /// A datagram arrived.
    pub fn on_packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// A sealed datagram went out.
    pub fn on_packet_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// An envelope failed to open (auth failure, replay, staleness).
    pub fn on_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram was dropped because a worker queue was full.
    pub fn on_worker_drop(&self) {
        self.worker_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram-substrate session was provisioned.
    pub fn on_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram-substrate session was retired.
    pub fn on_session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// A target connection was registered.
    pub fn on_target_opened(&self) {
        self.targets_opened.fetch_add(1, Ordering::Relaxed);
        self.targets_active.fetch_add(1, Ordering::Relaxed);
    }

    /// A target connection was removed.
    pub fn on_target_closed(&self) {
        self.targets_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// A stream-substrate connection was accepted.
    pub fn on_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.streams_active.fetch_add(1, Ordering::Relaxed);
    }

    /// A stream-substrate connection ended.
    pub fn on_stream_closed(&self) {
        self.streams_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Seconds since startup.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            worker_drops: self.worker_drops.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            targets_opened: self.targets_opened.load(Ordering::Relaxed),
            targets_active: self.targets_active.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_active: self.streams_active.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all counters at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since startup
    pub uptime_secs: u64,
    /// Datagrams received
    pub packets_in: u64,
    /// Sealed datagrams sent
    pub packets_out: u64,
    /// Envelopes that failed to open
    pub open_failures: u64,
    /// Datagrams dropped at full worker queues
    pub worker_drops: u64,
    /// Sessions ever provisioned
    pub sessions_opened: u64,
    /// Sessions currently live
    pub sessions_active: u64,
    /// Target connections ever registered
    pub targets_opened: u64,
    /// Target connections currently live
    pub targets_active: u64,
    /// Stream connections ever accepted
    pub streams_opened: u64,
    /// Stream connections currently live
    pub streams_active: u64,
}
