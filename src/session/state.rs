// Session states and the transitions allowed between them

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Preview,
    SingleShotPrepare1,
    SingleShotPrepare2,
    SingleShotStart,
    SingleShotFinalize,
    BurstPrepare1,
    BurstPrepare2,
    BurstStart,
    BurstFinalize,
    ContinuousPrepare1,
    ContinuousPrepare2,
    ContinuousStart,
    StopSync,
    Stop,
}

impl SessionState {
    /// Name reported to notification listeners
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Preview => "STATE_PREVIEW",
            SessionState::SingleShotPrepare1 => "STATE_SINGLESHOT_PREPARE1",
            SessionState::SingleShotPrepare2 => "STATE_SINGLESHOT_PREPARE2",
            SessionState::SingleShotStart => "STATE_SINGLESHOT_START",
            SessionState::SingleShotFinalize => "STATE_SINGLESHOT_FINALIZE",
            SessionState::BurstPrepare1 => "STATE_BURST_PREPARE1",
            SessionState::BurstPrepare2 => "STATE_BURST_PREPARE2",
            SessionState::BurstStart => "STATE_BURST_START",
            SessionState::BurstFinalize => "STATE_BURST_FINALIZE",
            SessionState::ContinuousPrepare1 => "STATE_CONTINUOUS_PREPARE1",
            SessionState::ContinuousPrepare2 => "STATE_CONTINUOUS_PREPARE2",
            SessionState::ContinuousStart => "STATE_CONTINUOUS_START",
            SessionState::StopSync => "STATE_STOP_SYNC",
            SessionState::Stop => "STATE_STOP",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, next),
            (Preview, SingleShotPrepare1)
                | (Preview, BurstPrepare1)
                | (Preview, ContinuousPrepare1)
                | (SingleShotPrepare1, SingleShotPrepare2)
                | (SingleShotPrepare2, SingleShotStart)
                | (SingleShotStart, SingleShotFinalize)
                | (SingleShotFinalize, Preview)
                | (BurstPrepare1, BurstPrepare2)
                | (BurstPrepare2, BurstStart)
                | (BurstStart, BurstFinalize)
                | (BurstFinalize, Preview)
                | (ContinuousPrepare1, ContinuousPrepare2)
                | (ContinuousPrepare2, ContinuousStart)
                | (ContinuousStart, StopSync)
                | (StopSync, Stop)
                | (Stop, Preview)
        ) || (next == Stop && self.is_recording())
    }

    /// Whether an active recording set exists in this state
    pub fn is_recording(&self) -> bool {
        !matches!(self, SessionState::Preview | SessionState::Stop)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn single_shot_path_is_linear() {
        let path = [SingleShotPrepare1, SingleShotPrepare2, SingleShotStart, SingleShotFinalize, Preview];
        let mut state = Preview;
        for next in path {
            assert!(state.can_transition_to(next), "{} -> {}", state, next);
            state = next;
        }
        assert!(!Preview.can_transition_to(SingleShotStart));
        assert!(!SingleShotPrepare1.can_transition_to(BurstPrepare2));
    }

    #[test]
    fn continuous_runs_until_stopped() {
        assert!(ContinuousStart.can_transition_to(StopSync));
        assert!(ContinuousStart.can_transition_to(Stop));
        assert!(!ContinuousStart.can_transition_to(Preview));
        assert!(Stop.can_transition_to(Preview));
        assert!(!Preview.can_transition_to(Stop));
    }

    #[test]
    fn names_match_listener_protocol() {
        assert_eq!(BurstFinalize.as_str(), "STATE_BURST_FINALIZE");
        assert_eq!(StopSync.to_string(), "STATE_STOP_SYNC");
    }
}
