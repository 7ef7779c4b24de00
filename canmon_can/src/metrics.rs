//! Latency metrics, diagnostics record and transport counters.

use crate::driver::DriverStatus;
use std::sync::atomic::{AtomicU64, Ordering};

/// TX latency statistics, updated by the TX worker under its mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyMetrics {
    /// Number of samples recorded.
    pub samples: u64,
    /// Sum of all samples [µs].
    pub total_us: u64,
    /// Smallest sample [µs]; zero while no samples exist.
    pub min_us: u64,
    /// Largest sample [µs].
    pub max_us: u64,
}

impl LatencyMetrics {
    /// Record one latency sample.
    pub fn record(&mut self, us: u64) {
        if self.samples == 0 {
            self.min_us = us;
            self.max_us = us;
        } else {
            self.min_us = self.min_us.min(us);
            self.max_us = self.max_us.max(us);
        }
        self.samples += 1;
        self.total_us += us;
    }

    /// Arithmetic mean of all samples [µs]; zero when empty.
    pub fn mean_us(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_us as f64 / self.samples as f64
        }
    }
}

/// TX queue occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Frames currently queued.
    pub depth: usize,
    /// Queue capacity.
    pub capacity: usize,
}

impl QueueStatus {
    /// Occupancy as an integer percentage of capacity.
    pub fn fill_pct(&self) -> usize {
        if self.capacity == 0 {
            0
        } else {
            self.depth * 100 / self.capacity
        }
    }
}

/// Snapshot of controller error counters plus transport-derived totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanDiagnostics {
    /// Controller TX error counter.
    pub tx_error_counter: u32,
    /// Controller RX error counter.
    pub rx_error_counter: u32,
    /// Controller is in the bus-off state.
    pub bus_off: bool,
    /// Total frame retransmissions performed by the TX worker.
    pub retransmissions: u64,
    /// Collision proxy total.
    pub collisions: u64,
    /// Total transmission attempts (first tries plus retries).
    pub tx_attempts: u64,
}

/// Lock-free transport counters, shared between workers and readers.
#[derive(Debug, Default)]
pub struct TransportCounters {
    /// Transmission attempts (first tries plus retries).
    pub attempts: AtomicU64,
    /// Retransmissions performed.
    pub retransmissions: AtomicU64,
    /// Collision proxy count.
    pub collisions: AtomicU64,
    /// Frames whose retry budget was exhausted.
    pub fatal_tx_errors: AtomicU64,
    /// Frames received from the driver.
    pub frames_received: AtomicU64,
    /// Received frames dropped on checksum mismatch.
    pub rx_checksum_failures: AtomicU64,
    /// Accumulated bus-busy time [µs].
    pub bus_busy_us: AtomicU64,
}

impl TransportCounters {
    /// Assemble the diagnostics record from a controller status snapshot.
    pub fn diagnostics(&self, status: DriverStatus) -> CanDiagnostics {
        CanDiagnostics {
            tx_error_counter: status.tx_error_counter,
            rx_error_counter: status.rx_error_counter,
            bus_off: status.state == crate::driver::BusState::BusOff,
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            tx_attempts: self.attempts.load(Ordering::Relaxed),
        }
    }
}
