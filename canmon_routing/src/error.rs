//! Error kinds surfaced at the routing boundary.

use thiserror::Error;

/// Error type for routing operations.
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    /// Caller passed a missing required input.
    #[error("required input missing: {0}")]
    NullInput(&'static str),

    /// The routing table is at capacity.
    #[error("routing table full ({0} entries)")]
    TableFull(usize),

    /// An entry with the same destination already exists.
    #[error("duplicate route for destination '{0}'")]
    DuplicateRoute(String),

    /// No entry exists for the destination.
    #[error("no route for destination '{0}'")]
    NoRoute(String),

    /// Dispatch failed after the recompute/retry fallback.
    #[error("route failure for '{0}'")]
    RouteFailure(String),

    /// The mesh radio rejected a send.
    #[error("mesh radio error: {0}")]
    Radio(String),

    /// The bounded subscriber list is full.
    #[error("subscriber limit ({0}) reached")]
    SubscriberLimit(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_destination() {
        let err = RoutingError::RouteFailure("ECU_X".to_string());
        assert!(err.to_string().contains("ECU_X"));
    }
}
