//! Observability and Metrics
//!
//! Per-manager counters for connection lifecycle, frame traffic and faults.
//! Each connection manager owns one [`Metrics`] instance; there is no global.
//!
//! Uses atomic counters so a snapshot can be taken from another thread while
//! the owning manager keeps ticking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for one connection manager
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections refused because the server was full or shutting down
    pub connections_rejected: AtomicU64,
    /// Frames dispatched to handlers
    pub frames_received: AtomicU64,
    /// Frames queued for transmission
    pub frames_sent: AtomicU64,
    /// Total bytes written to transports
    pub bytes_sent: AtomicU64,
    /// Total bytes read from transports
    pub bytes_received: AtomicU64,
    /// Frames with an invalid length prefix
    pub malformed_frames: AtomicU64,
    /// Frames whose opcode had no registered handler
    pub unknown_opcodes: AtomicU64,
    /// Handler invocations that returned an error
    pub handler_errors: AtomicU64,
    /// Transport read/write failures
    pub transport_errors: AtomicU64,
    /// Pool leaks reported by the sweep
    pub pool_leaks: AtomicU64,
    /// Heartbeats executed
    pub ticks: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            unknown_opcodes: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            pool_leaks: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame handed to a handler
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame queued for sending
    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, byte_count: u64) {
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_opcode(&self) {
        self.unknown_opcodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_leaks_reported(&self, count: u64) {
        self.pool_leaks.fetch_add(count, Ordering::Relaxed);
    }

    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_opcodes: self.unknown_opcodes.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            pool_leaks: self.pool_leaks.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            malformed_frames = snapshot.malformed_frames,
            unknown_opcodes = snapshot.unknown_opcodes,
            handler_errors = snapshot.handler_errors,
            transport_errors = snapshot.transport_errors,
            pool_leaks = snapshot.pool_leaks,
            ticks = snapshot.ticks,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection manager metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub malformed_frames: u64,
    pub unknown_opcodes: u64,
    pub handler_errors: u64,
    pub transport_errors: u64,
    pub pool_leaks: u64,
    pub ticks: u64,
    pub uptime_seconds: u64,
}
