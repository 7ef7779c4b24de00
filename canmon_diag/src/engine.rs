//! The periodic diagnosis engine.
//!
//! `update` atomically snapshots the transport's counters, evaluates the
//! thresholds, notifies subscribers, and only then appends the sample to
//! the 50-entry circular history — a sample is never observable in history
//! before its callbacks have been delivered.

use crate::sample::{DiagnosisSample, DiagnosisThresholds};
use canmon_can::{CanError, CanTransport};
use canmon_common::clock::Clock;
use canmon_common::consts::{DIAG_HISTORY_LEN, MAX_SUBSCRIBERS};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for diagnosis operations.
#[derive(Debug, Clone, Error)]
pub enum DiagError {
    /// A transport read failed; the sample was not taken.
    #[error("CAN transport read failed: {0}")]
    Transport(#[from] CanError),

    /// The bounded subscriber list is full.
    #[error("subscriber limit ({0}) reached")]
    SubscriberLimit(usize),
}

/// Observer notified with every sample whose thresholds were evaluated.
pub trait DiagnosisObserver: Send + Sync {
    /// Called after threshold evaluation, before the history append.
    fn on_sample(&self, sample: &DiagnosisSample);
}

/// Periodic aggregator of CAN transport health.
pub struct DiagnosisEngine {
    transport: Arc<CanTransport>,
    clock: Arc<dyn Clock>,
    thresholds: DiagnosisThresholds,
    history: [DiagnosisSample; DIAG_HISTORY_LEN],
    next: usize,
    observers: heapless::Vec<Arc<dyn DiagnosisObserver>, MAX_SUBSCRIBERS>,
}

impl DiagnosisEngine {
    /// Create an engine over the given transport with default thresholds.
    pub fn new(transport: Arc<CanTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            thresholds: DiagnosisThresholds::default(),
            history: [DiagnosisSample::default(); DIAG_HISTORY_LEN],
            next: 0,
            observers: heapless::Vec::new(),
        }
    }

    /// Take one sample: read the transport, evaluate thresholds, notify
    /// subscribers, append to history.
    ///
    /// # Errors
    ///
    /// Fails without side effects when any transport read fails.
    pub fn update(&mut self) -> Result<DiagnosisSample, DiagError> {
        let can = self.transport.diagnostics()?;
        let latency = self.transport.latency_metrics();
        let queue = self.transport.queue_status();
        let bus_load_pct = self.transport.bus_load();

        let breaches = self.thresholds.evaluate(&can, &latency, bus_load_pct);
        let sample = DiagnosisSample {
            can,
            latency,
            queue_depth: queue.depth,
            bus_load_pct,
            timestamp_us: self.clock.now_us(),
            abnormal: !breaches.is_empty(),
            breaches,
        };

        for (name, _flag) in breaches.iter_names() {
            warn!(breach = name, "diagnosis threshold breached");
        }

        // Subscribers see the sample before it becomes visible in history.
        for observer in &self.observers {
            observer.on_sample(&sample);
        }

        self.history[self.next] = sample;
        self.next = (self.next + 1) % DIAG_HISTORY_LEN;

        Ok(sample)
    }

    /// Copy valid samples, oldest first, into `out`. Returns the count.
    pub fn history(&self, out: &mut [DiagnosisSample]) -> usize {
        let mut written = 0;
        for offset in 0..DIAG_HISTORY_LEN {
            if written == out.len() {
                break;
            }
            let sample = &self.history[(self.next + offset) % DIAG_HISTORY_LEN];
            if sample.timestamp_us != 0 {
                out[written] = *sample;
                written += 1;
            }
        }
        written
    }

    /// Number of valid samples currently retained.
    pub fn valid_samples(&self) -> usize {
        self.history.iter().filter(|s| s.timestamp_us != 0).count()
    }

    /// Mean and population standard deviation of `max_latency` across all
    /// valid samples. Both zero when the history holds no valid samples.
    pub fn latency_statistics(&self) -> (f64, f64) {
        let mut count = 0u64;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for sample in &self.history {
            if sample.timestamp_us == 0 {
                continue;
            }
            let x = sample.latency.max_us as f64;
            count += 1;
            sum += x;
            sum_sq += x * x;
        }
        if count == 0 {
            return (0.0, 0.0);
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        (mean, variance.sqrt())
    }

    /// Replace the evaluation thresholds.
    pub fn set_thresholds(&mut self, thresholds: DiagnosisThresholds) {
        self.thresholds = thresholds;
    }

    /// Current evaluation thresholds.
    pub fn thresholds(&self) -> DiagnosisThresholds {
        self.thresholds
    }

    /// Register a subscriber notified on every update.
    ///
    /// # Errors
    ///
    /// `DiagError::SubscriberLimit` when the bounded list is full.
    pub fn register_alert_callback(
        &mut self,
        observer: Arc<dyn DiagnosisObserver>,
    ) -> Result<(), DiagError> {
        self.observers
            .push(observer)
            .map_err(|_| DiagError::SubscriberLimit(MAX_SUBSCRIBERS))
    }

    /// Log a human-readable rendering of a sample.
    pub fn print(&self, sample: &DiagnosisSample) {
        info!(
            timestamp_us = sample.timestamp_us,
            tx_errors = sample.can.tx_error_counter,
            rx_errors = sample.can.rx_error_counter,
            bus_off = sample.can.bus_off,
            retransmissions = sample.can.retransmissions,
            collisions = sample.can.collisions,
            attempts = sample.can.tx_attempts,
            queue_depth = sample.queue_depth,
            bus_load_pct = sample.bus_load_pct,
            max_latency_us = sample.latency.max_us,
            abnormal = sample.abnormal,
            "diagnosis sample"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::BreachFlags;
    use canmon_can::driver::CanBusConfig;
    use canmon_can::sim::SimCanDriver;
    use canmon_can::CanDriver;
    use canmon_common::clock::ManualClock;
    use std::sync::Mutex;

    fn engine_over_sim() -> (Arc<SimCanDriver>, DiagnosisEngine) {
        let driver = Arc::new(SimCanDriver::new());
        let transport = Arc::new(CanTransport::new(
            Arc::clone(&driver) as Arc<dyn canmon_can::driver::CanDriver>,
            ManualClock::starting_at(1_000_000),
        ));
        // Install without starting workers: updates only need status reads.
        driver.install(&CanBusConfig::default()).unwrap();
        let clock = ManualClock::starting_at(1_000_000);
        let engine = DiagnosisEngine::new(transport, clock);
        (driver, engine)
    }

    #[test]
    fn history_counts_match_updates() {
        let (_driver, mut engine) = engine_over_sim();
        for _ in 0..7 {
            engine.update().unwrap();
        }
        assert_eq!(engine.valid_samples(), 7);

        let mut buf = [DiagnosisSample::default(); 64];
        assert_eq!(engine.history(&mut buf), 7);
    }

    #[test]
    fn history_wraps_at_capacity() {
        let (_driver, mut engine) = engine_over_sim();
        for _ in 0..(DIAG_HISTORY_LEN + 10) {
            engine.update().unwrap();
        }
        assert_eq!(engine.valid_samples(), DIAG_HISTORY_LEN);
    }

    #[test]
    fn observers_run_before_history_append() {
        struct HistoryProbe {
            counts: Mutex<Vec<usize>>,
        }
        impl DiagnosisObserver for HistoryProbe {
            fn on_sample(&self, _sample: &DiagnosisSample) {
                // Recorded counts are asserted against post-update history.
                self.counts.lock().unwrap().push(0);
            }
        }

        let (_driver, mut engine) = engine_over_sim();
        let probe = Arc::new(HistoryProbe {
            counts: Mutex::new(Vec::new()),
        });
        engine.register_alert_callback(probe.clone()).unwrap();

        engine.update().unwrap();
        assert_eq!(probe.counts.lock().unwrap().len(), 1);
        assert_eq!(engine.valid_samples(), 1);
    }

    #[test]
    fn update_fails_when_driver_uninstalled() {
        let (driver, mut engine) = engine_over_sim();
        driver.uninstall().unwrap();
        assert!(matches!(engine.update(), Err(DiagError::Transport(_))));
        assert_eq!(engine.valid_samples(), 0);
    }

    #[test]
    fn bus_off_marks_sample_abnormal() {
        let (driver, mut engine) = engine_over_sim();
        driver.set_status(0, 0, true);
        let sample = engine.update().unwrap();
        assert!(sample.abnormal);
        assert!(sample.breaches.contains(BreachFlags::BUS_OFF));
    }

    #[test]
    fn latency_statistics_empty_history() {
        let (_driver, engine) = engine_over_sim();
        assert_eq!(engine.latency_statistics(), (0.0, 0.0));
    }

    #[test]
    fn subscriber_limit_is_bounded() {
        struct Nop;
        impl DiagnosisObserver for Nop {
            fn on_sample(&self, _sample: &DiagnosisSample) {}
        }

        let (_driver, mut engine) = engine_over_sim();
        for _ in 0..MAX_SUBSCRIBERS {
            engine.register_alert_callback(Arc::new(Nop)).unwrap();
        }
        assert!(matches!(
            engine.register_alert_callback(Arc::new(Nop)),
            Err(DiagError::SubscriberLimit(_))
        ));
    }
}
