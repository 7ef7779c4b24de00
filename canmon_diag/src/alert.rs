//! Ring-buffered alert sink.
//!
//! Turns abnormal diagnosis samples into alerts. Each invocation of
//! `check_conditions` emits at most one alert per triggered rule, in a
//! fixed order: bus-off first (critical), then error counters, bus load
//! and retransmissions (warnings). Entries overwrite silently once the
//! 100-entry ring is full.

use crate::engine::DiagnosisObserver;
use crate::sample::DiagnosisSample;
use canmon_common::clock::Clock;
use canmon_common::consts::{
    ALERT_RING_LEN, DEFAULT_BUS_LOAD_THRESHOLD, DEFAULT_RETRANS_THRESHOLD,
    DEFAULT_RX_ERROR_THRESHOLD, DEFAULT_TX_ERROR_THRESHOLD, MAX_MSG_LEN,
};
use canmon_common::level::Severity;
use canmon_common::text::bounded_string;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

/// One ring-buffered alert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertEntry {
    /// RTC timestamp [ms since epoch]; zero marks an empty slot.
    pub timestamp_ms: u64,
    /// Alert severity.
    pub severity: Severity,
    /// Message, truncated to the ring's fixed entry size.
    pub message: heapless::String<MAX_MSG_LEN>,
}

/// Observer of emitted alerts.
pub trait AlertObserver: Send + Sync {
    /// Called once per emitted alert.
    fn on_alert(&self, entry: &AlertEntry);
}

/// Alert rule thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// TX error counter threshold.
    pub tx_errors: u32,
    /// RX error counter threshold.
    pub rx_errors: u32,
    /// Bus-load threshold [%].
    pub bus_load_pct: f64,
    /// Retransmission total threshold.
    pub retransmissions: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            tx_errors: DEFAULT_TX_ERROR_THRESHOLD,
            rx_errors: DEFAULT_RX_ERROR_THRESHOLD,
            bus_load_pct: DEFAULT_BUS_LOAD_THRESHOLD,
            retransmissions: DEFAULT_RETRANS_THRESHOLD,
        }
    }
}

struct Ring {
    entries: [AlertEntry; ALERT_RING_LEN],
    next: usize,
    total: u64,
}

/// Ring-buffered alert log with threshold rules and subscriber forwarding.
pub struct AlertSink {
    clock: Arc<dyn Clock>,
    thresholds: Mutex<AlertThresholds>,
    ring: Mutex<Ring>,
    log_channel: Mutex<Option<Arc<dyn AlertObserver>>>,
    callback: Mutex<Option<Arc<dyn AlertObserver>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AlertSink {
    /// Create a sink with default thresholds.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            thresholds: Mutex::new(AlertThresholds::default()),
            ring: Mutex::new(Ring {
                entries: core::array::from_fn(|_| AlertEntry::default()),
                next: 0,
                total: 0,
            }),
            log_channel: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    /// Evaluate the alert rules against a sample.
    ///
    /// At most one alert is emitted per triggered rule per invocation.
    pub fn check_conditions(&self, sample: &DiagnosisSample) {
        let thresholds = *lock(&self.thresholds);

        if sample.can.bus_off {
            self.emit(Severity::Critical, "Estado Bus-Off detectado!");
        }
        if sample.can.tx_error_counter > thresholds.tx_errors
            || sample.can.rx_error_counter > thresholds.rx_errors
        {
            self.emit(
                Severity::Warning,
                &format!(
                    "Error counters elevated: TX={} RX={}",
                    sample.can.tx_error_counter, sample.can.rx_error_counter
                ),
            );
        }
        if sample.bus_load_pct > thresholds.bus_load_pct {
            self.emit(
                Severity::Warning,
                &format!(
                    "Bus load {:.1}% over threshold {:.1}%",
                    sample.bus_load_pct, thresholds.bus_load_pct
                ),
            );
        }
        if sample.can.retransmissions > thresholds.retransmissions {
            self.emit(
                Severity::Warning,
                &format!(
                    "Retransmissions {} over threshold {}",
                    sample.can.retransmissions, thresholds.retransmissions
                ),
            );
        }
    }

    fn emit(&self, severity: Severity, message: &str) {
        let entry = AlertEntry {
            timestamp_ms: self.clock.now_ms(),
            severity,
            message: bounded_string(message),
        };

        match severity {
            Severity::Critical => error!(alert = message, "critical alert"),
            Severity::Warning => warn!(alert = message, "warning alert"),
            Severity::Info => info!(alert = message, "info alert"),
        }

        {
            let mut ring = lock(&self.ring);
            let slot = ring.next;
            ring.entries[slot] = entry.clone();
            ring.next = (ring.next + 1) % ALERT_RING_LEN;
            ring.total += 1;
        }

        if let Some(channel) = lock(&self.log_channel).clone() {
            channel.on_alert(&entry);
        }
        if let Some(callback) = lock(&self.callback).clone() {
            callback.on_alert(&entry);
        }
    }

    /// Copy valid alerts, oldest first, into `out`. Returns the count.
    pub fn history(&self, out: &mut [AlertEntry]) -> usize {
        let ring = lock(&self.ring);
        let mut written = 0;
        for offset in 0..ALERT_RING_LEN {
            if written == out.len() {
                break;
            }
            let entry = &ring.entries[(ring.next + offset) % ALERT_RING_LEN];
            if entry.timestamp_ms != 0 {
                out[written] = entry.clone();
                written += 1;
            }
        }
        written
    }

    /// Total alerts emitted since creation, including overwritten ones.
    pub fn total_emitted(&self) -> u64 {
        lock(&self.ring).total
    }

    /// Log every retained alert.
    pub fn print_history(&self) {
        let ring = lock(&self.ring);
        for offset in 0..ALERT_RING_LEN {
            let entry = &ring.entries[(ring.next + offset) % ALERT_RING_LEN];
            if entry.timestamp_ms != 0 {
                info!(
                    timestamp_ms = entry.timestamp_ms,
                    severity = %entry.severity,
                    "{}",
                    entry.message
                );
            }
        }
    }

    /// Replace the alert thresholds.
    pub fn set_thresholds(&self, thresholds: AlertThresholds) {
        *lock(&self.thresholds) = thresholds;
    }

    /// Wire the logger's alert channel. Every alert is forwarded there.
    pub fn set_log_channel(&self, channel: Arc<dyn AlertObserver>) {
        *lock(&self.log_channel) = Some(channel);
    }

    /// Register the subscriber callback, replacing any previous one.
    pub fn register_callback(&self, callback: Arc<dyn AlertObserver>) {
        *lock(&self.callback) = Some(callback);
    }
}

impl DiagnosisObserver for AlertSink {
    fn on_sample(&self, sample: &DiagnosisSample) {
        self.check_conditions(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmon_can::CanDiagnostics;
    use canmon_common::clock::ManualClock;

    fn sink() -> AlertSink {
        AlertSink::new(ManualClock::starting_at(5_000_000))
    }

    fn sample_with(can: CanDiagnostics, bus_load_pct: f64) -> DiagnosisSample {
        DiagnosisSample {
            can,
            bus_load_pct,
            timestamp_us: 5_000_000,
            ..DiagnosisSample::default()
        }
    }

    #[test]
    fn bus_off_emits_single_critical() {
        let sink = sink();
        let can = CanDiagnostics {
            bus_off: true,
            ..CanDiagnostics::default()
        };
        sink.check_conditions(&sample_with(can, 0.0));

        let mut buf: Vec<AlertEntry> = vec![AlertEntry::default(); 4];
        assert_eq!(sink.history(&mut buf), 1);
        assert_eq!(buf[0].severity, Severity::Critical);
        assert_eq!(buf[0].message.as_str(), "Estado Bus-Off detectado!");
        assert_eq!(buf[0].timestamp_ms, 5_000);
    }

    #[test]
    fn error_counters_share_one_rule() {
        let sink = sink();
        let can = CanDiagnostics {
            tx_error_counter: 150,
            rx_error_counter: 150,
            ..CanDiagnostics::default()
        };
        sink.check_conditions(&sample_with(can, 0.0));
        // Both counters over threshold still produce one warning.
        assert_eq!(sink.total_emitted(), 1);
    }

    #[test]
    fn rules_fire_in_order() {
        let sink = sink();
        let can = CanDiagnostics {
            bus_off: true,
            tx_error_counter: 150,
            retransmissions: 60,
            ..CanDiagnostics::default()
        };
        sink.check_conditions(&sample_with(can, 90.0));

        let mut buf: Vec<AlertEntry> = vec![AlertEntry::default(); 8];
        assert_eq!(sink.history(&mut buf), 4);
        assert_eq!(buf[0].severity, Severity::Critical);
        assert!(buf[1].message.contains("Error counters"));
        assert!(buf[2].message.contains("Bus load"));
        assert!(buf[3].message.contains("Retransmissions"));
    }

    #[test]
    fn ring_overwrites_silently() {
        let sink = sink();
        let can = CanDiagnostics {
            bus_off: true,
            ..CanDiagnostics::default()
        };
        for _ in 0..(ALERT_RING_LEN + 20) {
            sink.check_conditions(&sample_with(can, 0.0));
        }
        let mut buf: Vec<AlertEntry> = vec![AlertEntry::default(); ALERT_RING_LEN + 20];
        assert_eq!(sink.history(&mut buf), ALERT_RING_LEN);
        assert_eq!(sink.total_emitted(), (ALERT_RING_LEN + 20) as u64);
    }

    #[test]
    fn callback_receives_forwarded_alerts() {
        struct Capture(Mutex<Vec<AlertEntry>>);
        impl AlertObserver for Capture {
            fn on_alert(&self, entry: &AlertEntry) {
                self.0.lock().unwrap().push(entry.clone());
            }
        }

        let sink = sink();
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        sink.register_callback(capture.clone());

        let can = CanDiagnostics {
            bus_off: true,
            ..CanDiagnostics::default()
        };
        sink.check_conditions(&sample_with(can, 0.0));
        assert_eq!(capture.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn quiet_sample_emits_nothing() {
        let sink = sink();
        sink.check_conditions(&sample_with(CanDiagnostics::default(), 10.0));
        assert_eq!(sink.total_emitted(), 0);
    }
}
