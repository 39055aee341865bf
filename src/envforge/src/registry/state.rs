/// Environment lifecycle states
use crate::common::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an environment.
///
/// Transitions only move forward to the immediate successor, or to `Failed`
/// from any non-terminal state. `Ready` and `Failed` accept no transition;
/// re-entry for an update goes through `EnvironmentRegistry::begin_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentState {
    Requested,
    ArtifactVerifying,
    ArtifactVerified,
    Instantiating,
    Instantiated,
    Bootstrapping,
    Configuring,
    Ready,
    Failed { stage: Stage, reason: String },
}

impl EnvironmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvironmentState::Ready | EnvironmentState::Failed { .. })
    }

    /// Next state on success
    pub fn successor(&self) -> Option<EnvironmentState> {
        use EnvironmentState::*;
        match self {
            Requested => Some(ArtifactVerifying),
            ArtifactVerifying => Some(ArtifactVerified),
            ArtifactVerified => Some(Instantiating),
            Instantiating => Some(Instantiated),
            Instantiated => Some(Bootstrapping),
            Bootstrapping => Some(Configuring),
            Configuring => Some(Ready),
            Ready | Failed { .. } => None,
        }
    }

    pub fn can_transition_to(&self, next: &EnvironmentState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            EnvironmentState::Failed { .. } => true,
            other => self.successor().as_ref() == Some(other),
        }
    }

    /// Stage a failure in this state is attributed to.
    pub fn stage(&self) -> Option<Stage> {
        use EnvironmentState::*;
        match self {
            Requested | ArtifactVerifying => Some(Stage::ArtifactVerifying),
            ArtifactVerified | Instantiating => Some(Stage::Instantiating),
            Instantiated | Bootstrapping => Some(Stage::Bootstrapping),
            Configuring => Some(Stage::Configuring),
            Ready => None,
            Failed { stage, .. } => Some(*stage),
        }
    }

    /// `Ready`, or failed after the environment was instantiated.
    pub fn is_update_eligible(&self) -> bool {
        match self {
            EnvironmentState::Ready => true,
            EnvironmentState::Failed { stage, .. } => stage.is_post_instantiation(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        use EnvironmentState::*;
        match self {
            Requested => "Requested",
            ArtifactVerifying => "ArtifactVerifying",
            ArtifactVerified => "ArtifactVerified",
            Instantiating => "Instantiating",
            Instantiated => "Instantiated",
            Bootstrapping => "Bootstrapping",
            Configuring => "Configuring",
            Ready => "Ready",
            Failed { .. } => "Failed",
        }
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentState::Failed { stage, reason } => {
                write!(f, "Failed({}: {})", stage, reason)
            }
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnvironmentState::*;

    fn failed(stage: Stage) -> EnvironmentState {
        Failed {
            stage,
            reason: "boom".to_string(),
        }
    }

    #[test]
    fn forward_chain_reaches_ready() {
        let mut state = Requested;
        let mut steps = 0;
        while let Some(next) = state.successor() {
            assert!(state.can_transition_to(&next));
            state = next;
            steps += 1;
        }
        assert_eq!(state, Ready);
        assert_eq!(steps, 7);
    }

    #[test]
    fn no_skipping_or_retraction() {
        assert!(!ArtifactVerifying.can_transition_to(&Instantiating));
        assert!(!Instantiated.can_transition_to(&Configuring));
        assert!(!Configuring.can_transition_to(&Bootstrapping));
        assert!(!Bootstrapping.can_transition_to(&Bootstrapping));
    }

    #[test]
    fn failed_reachable_from_non_terminal_only() {
        for state in [
            Requested,
            ArtifactVerifying,
            ArtifactVerified,
            Instantiating,
            Instantiated,
            Bootstrapping,
            Configuring,
        ] {
            assert!(state.can_transition_to(&failed(Stage::Configuring)), "{}", state);
        }
        assert!(!Ready.can_transition_to(&failed(Stage::Configuring)));
        let dead = failed(Stage::Bootstrapping);
        assert!(!dead.can_transition_to(&Configuring));
        assert!(!dead.can_transition_to(&failed(Stage::Configuring)));
        assert!(!dead.can_transition_to(&Ready));
    }

    #[test]
    fn update_eligibility() {
        assert!(Ready.is_update_eligible());
        assert!(failed(Stage::Bootstrapping).is_update_eligible());
        assert!(failed(Stage::Configuring).is_update_eligible());
        assert!(!failed(Stage::Instantiating).is_update_eligible());
        assert!(!failed(Stage::ArtifactVerifying).is_update_eligible());
        assert!(!Instantiated.is_update_eligible());
        assert!(!Configuring.is_update_eligible());
    }

    #[test]
    fn serde_roundtrip_keeps_failure_context() {
        let state = Failed {
            stage: Stage::Bootstrapping,
            reason: "exit 100".to_string(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(serde_json::from_str::<EnvironmentState>(&json).unwrap(), state);
        assert_eq!(state.to_string(), "Failed(Bootstrapping: exit 100)");
    }
}
