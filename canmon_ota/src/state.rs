//! OTA state machine states and legal transitions.
//!
//! The transition graph is a DAG apart from the two recovery cycles back
//! to the start: `Failure → Rollback → Idle` (also `Failure → Idle` for
//! failures before anything was distributed) and `Success → Idle`.

use serde::{Deserialize, Serialize};

/// State of the per-ECU update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OtaState {
    /// No update activity.
    Idle = 0,
    /// An advertised version exceeds the installed one.
    UpdateAvailable = 1,
    /// Fetching the firmware image onto the SD card.
    Downloading = 2,
    /// Sending segments to the target ECU over the mesh.
    Distributing = 3,
    /// Committing the image through the platform OTA interface.
    Applying = 4,
    /// The update was committed and persisted.
    Success = 5,
    /// A pipeline step failed.
    Failure = 6,
    /// Restoring the previously installed image.
    Rollback = 7,
}

impl OtaState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::UpdateAvailable),
            2 => Some(Self::Downloading),
            3 => Some(Self::Distributing),
            4 => Some(Self::Applying),
            5 => Some(Self::Success),
            6 => Some(Self::Failure),
            7 => Some(Self::Rollback),
            _ => None,
        }
    }

    /// True for the states in which an update occupies the pipeline.
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::UpdateAvailable | Self::Downloading | Self::Distributing | Self::Applying
        )
    }

    /// Whether `self → to` is a legal transition of the pipeline.
    ///
    /// The `Idle → Downloading/Distributing/Applying` edges re-enter a
    /// step after an acknowledged failure; they never cycle back to the
    /// start.
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::UpdateAvailable)
                | (Self::Idle, Self::Downloading)
                | (Self::Idle, Self::Distributing)
                | (Self::Idle, Self::Applying)
                | (Self::UpdateAvailable, Self::Downloading)
                | (Self::Downloading, Self::Distributing)
                | (Self::Distributing, Self::Applying)
                | (Self::Applying, Self::Success)
                | (Self::Success, Self::Idle)
                | (Self::Downloading, Self::Failure)
                | (Self::Distributing, Self::Failure)
                | (Self::Applying, Self::Failure)
                | (Self::Failure, Self::Rollback)
                | (Self::Failure, Self::Idle)
                | (Self::Rollback, Self::Idle)
        )
    }
}

impl Default for OtaState {
    fn default() -> Self {
        Self::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OtaState; 8] = [
        OtaState::Idle,
        OtaState::UpdateAvailable,
        OtaState::Downloading,
        OtaState::Distributing,
        OtaState::Applying,
        OtaState::Success,
        OtaState::Failure,
        OtaState::Rollback,
    ];

    #[test]
    fn state_roundtrip() {
        for v in 0..=7u8 {
            let state = OtaState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(OtaState::from_u8(8).is_none());
        assert!(OtaState::from_u8(255).is_none());
    }

    #[test]
    fn happy_path_is_legal() {
        let path = [
            OtaState::Idle,
            OtaState::UpdateAvailable,
            OtaState::Downloading,
            OtaState::Distributing,
            OtaState::Applying,
            OtaState::Success,
            OtaState::Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn only_recovery_edges_return_to_idle() {
        for state in ALL {
            let returns = state.can_transition(OtaState::Idle);
            let expected = matches!(state, OtaState::Success | OtaState::Failure | OtaState::Rollback);
            assert_eq!(returns, expected, "{state:?} -> Idle");
        }
    }

    #[test]
    fn failure_exits_only_to_rollback_or_idle() {
        for state in ALL {
            let legal = OtaState::Failure.can_transition(state);
            let expected = matches!(state, OtaState::Rollback | OtaState::Idle);
            assert_eq!(legal, expected, "Failure -> {state:?}");
        }
    }

    #[test]
    fn active_states_are_exactly_the_pipeline() {
        assert!(!OtaState::Idle.is_active());
        assert!(OtaState::UpdateAvailable.is_active());
        assert!(OtaState::Downloading.is_active());
        assert!(OtaState::Distributing.is_active());
        assert!(OtaState::Applying.is_active());
        assert!(!OtaState::Success.is_active());
        assert!(!OtaState::Failure.is_active());
        assert!(!OtaState::Rollback.is_active());
    }
}
