//! Server metrics collection.
//!
//! Aggregate counters only. Nothing here identifies a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::protocol::ConnectionRole;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Total tunnel connections accepted
    total_connections: AtomicU64,
    /// Current active tunnel connections
    active_connections: AtomicU64,
    /// Connections that identified as control
    control_connections: AtomicU64,
    /// Connections that carried a SOCKS5 stream
    data_connections: AtomicU64,
    /// Hand-offs answered with `LOGIN_SUCCESS`
    handoffs_granted: AtomicU64,
    /// Hand-offs answered with `LOGIN_FAILED`
    handoffs_failed: AtomicU64,
    /// Connections closed for breaking the handshake contract
    protocol_violations: AtomicU64,
    /// Handshakes that timed out
    handshake_timeouts: AtomicU64,
    /// SOCKS5 targets that could not be reached
    target_failures: AtomicU64,
    /// Connections evicted by the liveness sweep
    evictions: AtomicU64,
    /// Bytes relayed tunnel → target
    bytes_up: AtomicU64,
    /// Bytes relayed target → tunnel
    bytes_down: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            control_connections: AtomicU64::new(0),
            data_connections: AtomicU64::new(0),
            handoffs_granted: AtomicU64::new(0),
            handoffs_failed: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            handshake_timeouts: AtomicU64::new(0),
            target_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a connection under its role.
    pub fn record_role(&self, role: ConnectionRole) {
        match role {
            ConnectionRole::Control => self.control_connections.fetch_add(1, Ordering::Relaxed),
            ConnectionRole::Data => self.data_connections.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Count a hand-off outcome.
    pub fn record_handoff(&self, granted: bool) {
        if granted {
            self.handoffs_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.handoffs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment protocol violation count.
    pub fn increment_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment handshake timeout count.
    pub fn increment_handshake_timeouts(&self) {
        self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment unreachable target count.
    pub fn increment_target_failures(&self) {
        self.target_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add evicted connections.
    pub fn add_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Add relayed bytes.
    pub fn add_relayed(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get granted hand-offs.
    pub fn handoffs_granted(&self) -> u64 {
        self.handoffs_granted.load(Ordering::Relaxed)
    }

    /// Get failed hand-offs.
    pub fn handoffs_failed(&self) -> u64 {
        self.handoffs_failed.load(Ordering::Relaxed)
    }

    /// Get protocol violations.
    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            control_connections: self.control_connections.load(Ordering::Relaxed),
            data_connections: self.data_connections.load(Ordering::Relaxed),
            handoffs_granted: self.handoffs_granted(),
            handoffs_failed: self.handoffs_failed(),
            protocol_violations: self.protocol_violations(),
            handshake_timeouts: self.handshake_timeouts.load(Ordering::Relaxed),
            target_failures: self.target_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Linkshare Server Metrics
========================
Uptime: {} seconds

Connections:
  Total:    {}
  Active:   {}
  Control:  {}
  Data:     {}
  Evicted:  {}

Hand-offs:
  Granted:  {}
  Failed:   {}

Traffic:
  Up:       {} bytes
  Down:     {} bytes

Errors:
  Protocol Violations: {}
  Handshake Timeouts:  {}
  Unreachable Targets: {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.control_connections,
            snapshot.data_connections,
            snapshot.evictions,
            snapshot.handoffs_granted,
            snapshot.handoffs_failed,
            snapshot.bytes_up,
            snapshot.bytes_down,
            snapshot.protocol_violations,
            snapshot.handshake_timeouts,
            snapshot.target_failures,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since start
    pub uptime_secs: u64,
    /// Connections accepted
    pub total_connections: u64,
    /// Connections open now
    pub active_connections: u64,
    /// Control connections seen
    pub control_connections: u64,
    /// Data streams seen, including control connections that carried one
    pub data_connections: u64,
    /// Hand-offs that ended in `LOGIN_SUCCESS`
    pub handoffs_granted: u64,
    /// Hand-offs that ended in `LOGIN_FAILED`
    pub handoffs_failed: u64,
    /// Connections closed for a protocol violation
    pub protocol_violations: u64,
    /// Connections closed for a handshake timeout
    pub handshake_timeouts: u64,
    /// CONNECT targets that could not be reached
    pub target_failures: u64,
    /// Connections evicted by the liveness sweep
    pub evictions: u64,
    /// Bytes relayed towards targets
    pub bytes_up: u64,
    /// Bytes relayed back to clients
    pub bytes_down: u64,
}

impl MetricsSnapshot {
    /// Data connections per granted hand-off.
    pub fn streams_per_handoff(&self) -> f64 {
        if self.handoffs_granted == 0 {
            0.0
        } else {
            self.data_connections as f64 / self.handoffs_granted as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_up + self.bytes_down) as f64 / self.uptime_secs as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counting() {
        let metrics = ServerMetrics::new();

        metrics.increment_connections();
        metrics.increment_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 2);

        metrics.decrement_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_roles_and_handoffs() {
        let metrics = ServerMetrics::new();

        metrics.record_role(ConnectionRole::Control);
        metrics.record_role(ConnectionRole::Data);
        metrics.record_role(ConnectionRole::Data);
        metrics.record_handoff(true);
        metrics.record_handoff(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.control_connections, 1);
        assert_eq!(snapshot.data_connections, 2);
        assert_eq!(snapshot.handoffs_granted, 1);
        assert_eq!(snapshot.handoffs_failed, 1);
        assert!((snapshot.streams_per_handoff() - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_snapshot_throughput() {
        let metrics = ServerMetrics::new();
        metrics.add_relayed(1000, 2000);
        metrics.add_evictions(3);

        let mut snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_up, 1000);
        assert_eq!(snapshot.bytes_down, 2000);
        assert_eq!(snapshot.evictions, 3);

        snapshot.uptime_secs = 10;
        assert!((snapshot.throughput_bps() - 300.0).abs() < 0.01);
    }

    #[test]
    fn test_format_report() {
        let metrics = ServerMetrics::new();
        metrics.increment_connections();
        metrics.increment_protocol_violations();

        let report = metrics.format_report();
        assert!(report.contains("Linkshare Server Metrics"));
        assert!(report.contains("Total:    1"));
        assert!(report.contains("Protocol Violations: 1"));
    }
}
