//! Severity levels shared by the alert sink and the persistent logger.

use serde::{Deserialize, Serialize};

/// Severity of an alert or persisted log entry.
///
/// Ordering is by severity: `Info < Warning < Critical`. The logger drops
/// entries below its configured minimum level before timestamping them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    /// Informational entry.
    Info = 0,
    /// Threshold breach or degraded condition.
    Warning = 1,
    /// Bus-off, storage exhaustion, or other condition needing intervention.
    Critical = 2,
}

impl Severity {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Info),
            1 => Some(Self::Warning),
            2 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Short uppercase tag used in persisted log lines.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Critical => "CRIT",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_roundtrip() {
        for v in 0..=2u8 {
            let s = Severity::from_u8(v).unwrap();
            assert_eq!(s as u8, v);
        }
        assert!(Severity::from_u8(3).is_none());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }
}
