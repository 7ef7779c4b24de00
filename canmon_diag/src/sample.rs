//! Diagnosis samples, thresholds and breach flags.

use bitflags::bitflags;
use canmon_can::{CanDiagnostics, LatencyMetrics};
use canmon_common::config::DiagnosisKnobs;
use canmon_common::consts::*;

bitflags! {
    /// Which thresholds a sample breached.
    ///
    /// CRITICAL flags: BUS_OFF.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BreachFlags: u8 {
        /// TX error counter over threshold.
        const TX_ERRORS       = 0x01;
        /// RX error counter over threshold.
        const RX_ERRORS       = 0x02;
        /// Bus load over threshold.
        const BUS_LOAD        = 0x04;
        /// Maximum TX latency over threshold.
        const LATENCY         = 0x08;
        /// Retransmission total over threshold.
        const RETRANSMISSIONS = 0x10;
        /// Collision proxy total over threshold.
        const COLLISIONS      = 0x20;
        /// Controller reported bus-off. **CRITICAL**.
        const BUS_OFF         = 0x40;
    }
}

impl BreachFlags {
    /// Mask of flags that demand intervention.
    pub const CRITICAL_MASK: Self = Self::BUS_OFF;

    /// Returns true if any critical flag is set.
    #[inline]
    pub const fn has_critical(&self) -> bool {
        self.intersects(Self::CRITICAL_MASK)
    }
}

impl Default for BreachFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Thresholds the diagnosis engine evaluates on every update.
///
/// A field is breached when the observed value is *strictly greater* than
/// the threshold; a value exactly at the threshold is not abnormal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagnosisThresholds {
    /// TX error counter threshold.
    pub tx_errors: u32,
    /// RX error counter threshold.
    pub rx_errors: u32,
    /// Bus-load threshold [%].
    pub bus_load_pct: f64,
    /// Maximum-latency threshold [µs].
    pub max_latency_us: u64,
    /// Retransmission total threshold.
    pub retransmissions: u64,
    /// Collision proxy total threshold.
    pub collisions: u64,
}

impl Default for DiagnosisThresholds {
    fn default() -> Self {
        Self {
            tx_errors: DEFAULT_TX_ERROR_THRESHOLD,
            rx_errors: DEFAULT_RX_ERROR_THRESHOLD,
            bus_load_pct: DEFAULT_BUS_LOAD_THRESHOLD,
            max_latency_us: DEFAULT_MAX_LATENCY_THRESHOLD_US,
            retransmissions: DEFAULT_RETRANS_THRESHOLD,
            collisions: DEFAULT_COLLISION_THRESHOLD,
        }
    }
}

impl From<DiagnosisKnobs> for DiagnosisThresholds {
    fn from(knobs: DiagnosisKnobs) -> Self {
        Self {
            tx_errors: knobs.tx_error_threshold,
            rx_errors: knobs.rx_error_threshold,
            bus_load_pct: knobs.bus_load_threshold,
            max_latency_us: knobs.max_latency_threshold_us,
            retransmissions: knobs.retrans_threshold,
            collisions: knobs.collision_threshold,
        }
    }
}

impl DiagnosisThresholds {
    /// Evaluate every threshold against a sample's raw readings.
    pub fn evaluate(
        &self,
        can: &CanDiagnostics,
        latency: &LatencyMetrics,
        bus_load_pct: f64,
    ) -> BreachFlags {
        let mut breaches = BreachFlags::empty();
        if can.bus_off {
            breaches |= BreachFlags::BUS_OFF;
        }
        if can.tx_error_counter > self.tx_errors {
            breaches |= BreachFlags::TX_ERRORS;
        }
        if can.rx_error_counter > self.rx_errors {
            breaches |= BreachFlags::RX_ERRORS;
        }
        if bus_load_pct > self.bus_load_pct {
            breaches |= BreachFlags::BUS_LOAD;
        }
        if latency.max_us > self.max_latency_us {
            breaches |= BreachFlags::LATENCY;
        }
        if can.retransmissions > self.retransmissions {
            breaches |= BreachFlags::RETRANSMISSIONS;
        }
        if can.collisions > self.collisions {
            breaches |= BreachFlags::COLLISIONS;
        }
        breaches
    }
}

/// One fused snapshot of the CAN transport's health.
///
/// Lives in the engine's fixed-size circular history; a slot with a zero
/// timestamp has never been written and is excluded from statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiagnosisSample {
    /// Controller counters and transport totals.
    pub can: CanDiagnostics,
    /// TX latency metrics at sampling time.
    pub latency: LatencyMetrics,
    /// TX queue depth at sampling time.
    pub queue_depth: usize,
    /// Bus load at sampling time [%].
    pub bus_load_pct: f64,
    /// Sampling timestamp [µs since epoch]; zero marks an empty slot.
    pub timestamp_us: u64,
    /// At least one threshold was breached.
    pub abnormal: bool,
    /// Exactly which thresholds were breached.
    pub breaches: BreachFlags,
}
