//! System-wide constants for the CAN monitor workspace.
//!
//! Single source of truth for all numeric limits and default knobs.
//! Imported by all crates — no duplication permitted.

/// Capacity of the asynchronous CAN TX queue.
pub const TX_QUEUE_CAPACITY: usize = 32;

/// Capacity of the internal CAN RX buffer.
pub const RX_QUEUE_CAPACITY: usize = 32;

/// Maximum retransmission attempts per CAN frame before the TX error is fatal.
pub const CAN_MAX_RETRIES: u8 = 3;

/// Backoff between CAN retransmission attempts [ms].
pub const CAN_RETRY_BACKOFF_MS: u64 = 50;

/// TX queue fill level at which the TX task priority is raised [%].
pub const TX_QUEUE_HIGH_WATERMARK_PCT: usize = 80;

/// Number of samples retained in the diagnosis history ring.
pub const DIAG_HISTORY_LEN: usize = 50;

/// Number of entries retained in the alert ring.
pub const ALERT_RING_LEN: usize = 100;

/// Number of entries retained in the log ring.
pub const LOG_RING_LEN: usize = 100;

/// Maximum routing table entries.
pub const ROUTING_TABLE_CAP: usize = 16;

/// Maximum neighbour table entries.
pub const NEIGHBOUR_TABLE_CAP: usize = 8;

/// Maximum registered event subscribers per component.
pub const MAX_SUBSCRIBERS: usize = 5;

/// Maximum length of a mesh node / ECU identifier [bytes].
pub const MAX_ID_LEN: usize = 32;

/// Maximum length of an alert or log message [bytes].
pub const MAX_MSG_LEN: usize = 128;

/// Firmware segment size for OTA distribution [bytes].
pub const OTA_SEGMENT_SIZE: usize = 1024;

/// Reserved CAN ID used by the loopback self-test.
pub const CAN_ID_LOOPBACK_TEST: u32 = 0x0F00_0001;

/// Application-layer CAN command: set speed.
pub const CAN_CMD_SET_SPEED: u16 = 0x100;

/// Application-layer CAN command: fault report.
pub const CAN_CMD_FAULT: u16 = 0x200;

// ─── Default diagnosis / alert thresholds ──────────────────────────

/// Default TX error counter threshold.
pub const DEFAULT_TX_ERROR_THRESHOLD: u32 = 100;

/// Default RX error counter threshold.
pub const DEFAULT_RX_ERROR_THRESHOLD: u32 = 100;

/// Default bus-load threshold [%].
pub const DEFAULT_BUS_LOAD_THRESHOLD: f64 = 80.0;

/// Default maximum-latency threshold [µs].
pub const DEFAULT_MAX_LATENCY_THRESHOLD_US: u64 = 10_000;

/// Default retransmission-count threshold.
pub const DEFAULT_RETRANS_THRESHOLD: u64 = 50;

/// Default collision-count threshold.
pub const DEFAULT_COLLISION_THRESHOLD: u64 = 50;

// ─── Logger worker cadences ────────────────────────────────────────

/// Interval of the critical-log NVS flush worker [s].
pub const LOG_FLUSH_INTERVAL_S: u64 = 60;

/// Interval of the SD free-space monitor worker [s].
pub const LOG_MONITOR_INTERVAL_S: u64 = 30;

/// Consecutive SD save failures after which the error counter is reset.
pub const SD_FAILURE_RESET_LIMIT: u32 = 5;

/// Local retries around a single SD save before escalating.
pub const SD_LOCAL_RETRIES: u32 = 3;

// ─── Task priorities (logical, baseline → elevated) ────────────────

/// CAN TX task baseline priority.
pub const PRIO_CAN_TX: u8 = 10;

/// CAN TX task priority while the queue is above the high watermark.
pub const PRIO_CAN_TX_ELEVATED: u8 = 15;

/// CAN RX task priority.
pub const PRIO_CAN_RX: u8 = 10;

/// Routing event/send/receive task priority.
pub const PRIO_ROUTING: u8 = 5;

/// OTA / CAN acquisition / diagnosis task priority.
pub const PRIO_ACQUISITION: u8 = 3;

/// Communication task priority.
pub const PRIO_COMMUNICATION: u8 = 4;

/// Configuration update task priority.
pub const PRIO_CONFIG: u8 = 2;

/// Logger flush/async/monitor task priority.
pub const PRIO_LOGGER: u8 = 5;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.ini";

// Ring capacities are baked into fixed-size arrays; keep them sane.
static_assertions::const_assert!(TX_QUEUE_HIGH_WATERMARK_PCT <= 100);
static_assertions::const_assert!(DIAG_HISTORY_LEN <= ALERT_RING_LEN);
static_assertions::const_assert!((CAN_ID_LOOPBACK_TEST & !0x1FFF_FFFF) == 0);
