//! Error kinds surfaced at the CAN transport boundary.

use thiserror::Error;

/// Error type for CAN transport operations.
///
/// Driver bring-up and tear-down failures are non-recoverable at this
/// layer; receive timeouts are non-fatal and left to the caller.
#[derive(Debug, Clone, Error)]
pub enum CanError {
    /// Caller passed a missing required input.
    #[error("required input missing: {0}")]
    NullInput(&'static str),

    /// Payload too large or too small for the operation.
    #[error("invalid payload length {len} (limit {limit})")]
    InvalidLength {
        /// Offending length.
        len: usize,
        /// Allowed limit.
        limit: usize,
    },

    /// Driver failed to send a frame.
    #[error("transmit failed: {0}")]
    Transmit(String),

    /// Driver failed to receive, or the payload checksum mismatched.
    #[error("receive failed: {0}")]
    Receive(String),

    /// A bounded wait expired.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Driver installation failed.
    #[error("driver install failed: {0}")]
    DriverInstall(String),

    /// Driver start failed.
    #[error("driver start failed: {0}")]
    DriverStart(String),

    /// Driver stop failed.
    #[error("driver stop failed: {0}")]
    DriverStop(String),

    /// Driver uninstall failed.
    #[error("driver uninstall failed: {0}")]
    DriverUninstall(String),

    /// Everything else.
    #[error("CAN error: {0}")]
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = CanError::InvalidLength { len: 9, limit: 8 };
        assert!(err.to_string().contains('9'));
        assert!(err.to_string().contains('8'));

        let err = CanError::Timeout(250);
        assert!(err.to_string().contains("250"));
    }
}
