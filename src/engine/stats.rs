//! Engine statistics.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared between the engine and whoever wants to observe it.
pub struct EngineStats {
    start_time: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    peer_connections: AtomicU64,
    dns_failures: AtomicU64,
    protocol_errors: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl EngineStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            peer_connections: AtomicU64::new(0),
            dns_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
        }
    }

    /// A connection handler was created.
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection handler was destroyed.
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// An outbound peer socket was opened.
    pub fn peer_opened(&self) {
        self.peer_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dns_failed(&self) {
        self.dns_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes moved from one handler to its partner.
    pub fn add_relayed(&self, bytes: u64) {
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            peer_connections: self.peer_connections.load(Ordering::Relaxed),
            dns_failures: self.dns_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub peer_connections: u64,
    pub dns_failures: u64,
    pub protocol_errors: u64,
    pub bytes_relayed: u64,
}

impl StatsSnapshot {
    /// Relay throughput in bytes per second since start.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.bytes_relayed as f64 / self.uptime_secs as f64
        }
    }
}
