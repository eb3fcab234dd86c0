//! Tracking state machine.

/// State of the tracker.
///
/// `NotInitialized → Ok ⇄ Lost`, with `Shutdown` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No map yet; two-view initialization is being attempted.
    #[default]
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Tracking failed; every frame attempts relocalization.
    Lost,
    /// The system was shut down; no further frames are processed.
    Shutdown,
}

impl TrackingState {
    /// Whether a pose is emitted for frames in this state.
    pub fn has_pose(&self) -> bool {
        matches!(self, TrackingState::Ok)
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrackingState::NotInitialized => "NOT_INITIALIZED",
            TrackingState::Ok => "OK",
            TrackingState::Lost => "LOST",
            TrackingState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_ok_has_pose() {
        assert_eq!(TrackingState::default(), TrackingState::NotInitialized);
        assert!(TrackingState::Ok.has_pose());
        assert!(!TrackingState::Lost.has_pose());
        assert!(!TrackingState::Shutdown.has_pose());
        assert_eq!(TrackingState::Lost.to_string(), "LOST");
    }
}
