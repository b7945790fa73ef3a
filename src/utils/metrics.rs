//! Observability and Metrics
//!
//! This module provides metrics collection for pickling and unpickling
//! throughput and failures.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::PickleError;

/// Global metrics collector for codec operations
#[derive(Debug)]
pub struct Metrics {
    /// Values packed successfully
    pub values_packed: AtomicU64,
    /// Values unpacked successfully
    pub values_unpacked: AtomicU64,
    /// Total bytes produced by packing
    pub bytes_packed: AtomicU64,
    /// Total bytes consumed by unpacking
    pub bytes_unpacked: AtomicU64,
    /// Failed pack calls
    pub pickling_errors: AtomicU64,
    /// Malformed streams and other unpack failures
    pub unpickling_errors: AtomicU64,
    /// Globals rejected by the security gate
    pub security_violations: AtomicU64,
    /// Truncated inputs
    pub end_of_input_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            values_packed: AtomicU64::new(0),
            values_unpacked: AtomicU64::new(0),
            bytes_packed: AtomicU64::new(0),
            bytes_unpacked: AtomicU64::new(0),
            pickling_errors: AtomicU64::new(0),
            unpickling_errors: AtomicU64::new(0),
            security_violations: AtomicU64::new(0),
            end_of_input_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a packed value
    pub fn value_packed(&self, byte_count: u64) {
        self.values_packed.fetch_add(1, Ordering::Relaxed);
        self.bytes_packed.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record an unpacked value
    pub fn value_unpacked(&self, byte_count: u64) {
        self.values_unpacked.fetch_add(1, Ordering::Relaxed);
        self.bytes_unpacked.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a failed pack call
    pub fn pickling_error(&self) {
        self.pickling_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed unpack call by kind. Security denials are counted
    /// by the gate itself.
    pub fn unpickling_error(&self, err: &PickleError) {
        match err {
            PickleError::Security { .. } => {}
            PickleError::EndOfInput { .. } => {
                self.end_of_input_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.unpickling_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a security gate denial
    pub fn security_violation(&self) {
        self.security_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            values_packed: self.values_packed.load(Ordering::Relaxed),
            values_unpacked: self.values_unpacked.load(Ordering::Relaxed),
            bytes_packed: self.bytes_packed.load(Ordering::Relaxed),
            bytes_unpacked: self.bytes_unpacked.load(Ordering::Relaxed),
            pickling_errors: self.pickling_errors.load(Ordering::Relaxed),
            unpickling_errors: self.unpickling_errors.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::Relaxed),
            end_of_input_errors: self.end_of_input_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            values_packed = snapshot.values_packed,
            values_unpacked = snapshot.values_unpacked,
            bytes_packed = snapshot.bytes_packed,
            bytes_unpacked = snapshot.bytes_unpacked,
            pickling_errors = snapshot.pickling_errors,
            unpickling_errors = snapshot.unpickling_errors,
            security_violations = snapshot.security_violations,
            end_of_input_errors = snapshot.end_of_input_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Codec metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub values_packed: u64,
    pub values_unpacked: u64,
    pub bytes_packed: u64,
    pub bytes_unpacked: u64,
    pub pickling_errors: u64,
    pub unpickling_errors: u64,
    pub security_violations: u64,
    pub end_of_input_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let metrics = Metrics::new();
        metrics.unpickling_error(&PickleError::EndOfInput { needed: 1 });
        metrics.unpickling_error(&PickleError::malformed("bad"));
        metrics.unpickling_error(&PickleError::Security {
            module: "os".into(),
            name: "system".into(),
        });
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.end_of_input_errors, 1);
        assert_eq!(snapshot.unpickling_errors, 1);
        assert_eq!(snapshot.security_violations, 0);
    }

    #[test]
    fn test_byte_counters() {
        let metrics = Metrics::new();
        metrics.value_packed(10);
        metrics.value_packed(5);
        metrics.value_unpacked(7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.values_packed, 2);
        assert_eq!(snapshot.bytes_packed, 15);
        assert_eq!(snapshot.bytes_unpacked, 7);
    }
}
