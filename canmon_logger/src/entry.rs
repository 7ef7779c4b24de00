//! Persisted log entry shape.

use canmon_common::consts::MAX_MSG_LEN;
use canmon_common::level::Severity;
use serde::{Deserialize, Serialize};

/// One ring-buffered log entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RTC timestamp [ms since epoch]; zero marks an empty slot.
    pub timestamp_ms: u64,
    /// Entry severity.
    pub severity: Severity,
    /// Message, truncated to the ring's fixed entry size.
    pub message: heapless::String<MAX_MSG_LEN>,
}

impl LogEntry {
    /// Render the entry as a single persisted line.
    pub fn render_line(&self) -> String {
        format!("{} [{}] {}", self.timestamp_ms, self.severity.tag(), self.message)
    }
}
