//! Error kinds surfaced at the OTA boundary.

use canmon_logger::StorageError;
use thiserror::Error;

/// Error type for OTA operations.
#[derive(Debug, Clone, Error)]
pub enum OtaError {
    /// A second update was started while one is alive.
    #[error("update already in progress")]
    UpdateInProgress,

    /// Caller passed a missing required input.
    #[error("required input missing: {0}")]
    NullInput(&'static str),

    /// The MQTT collaborator failed.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// The SD storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Segment distribution over the mesh failed.
    #[error("distribution failed: {0}")]
    Distribute(String),

    /// The platform OTA collaborator rejected a step.
    #[error("apply failed: {0}")]
    Apply(String),

    /// Persisting the updated configuration failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Everything else.
    #[error("OTA error: {0}")]
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_convert() {
        let err: OtaError = StorageError::NotMounted.into();
        assert!(matches!(err, OtaError::Storage(_)));
    }
}
