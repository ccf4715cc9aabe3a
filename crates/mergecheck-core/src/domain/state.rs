//! Merge simulation state machine.

use serde::{Deserialize, Serialize};

use super::outcome::MergeOutcome;

/// State of one merge simulation.
///
/// State transitions:
/// - Init -> Cloned -> TargetCheckedOut -> MergeAttempted -> Finished(Clean | Conflicted)
/// - Init | Cloned | TargetCheckedOut -> Finished(FetchFailed)
///
/// Infrastructure faults abort the machine from any non-terminal state
/// without producing a `Finished` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeState {
    Init,
    Cloned,
    TargetCheckedOut,
    MergeAttempted,
    Finished(MergeOutcome),
}

impl MergeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MergeState::Finished(_))
    }

    /// The state following a successful step from `self`.
    pub fn advance(self) -> Option<MergeState> {
        match self {
            MergeState::Init => Some(MergeState::Cloned),
            MergeState::Cloned => Some(MergeState::TargetCheckedOut),
            MergeState::TargetCheckedOut => Some(MergeState::MergeAttempted),
            MergeState::MergeAttempted | MergeState::Finished(_) => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: MergeState) -> bool {
        match (self, next) {
            (MergeState::MergeAttempted, MergeState::Finished(outcome)) => {
                outcome != MergeOutcome::FetchFailed
            }
            (
                MergeState::Init | MergeState::Cloned | MergeState::TargetCheckedOut,
                MergeState::Finished(MergeOutcome::FetchFailed),
            ) => true,
            (from, to) => from.advance() == Some(to),
        }
    }

    /// Short label for logs.
    pub fn label(self) -> &'static str {
        match self {
            MergeState::Init => "init",
            MergeState::Cloned => "cloned",
            MergeState::TargetCheckedOut => "target_checked_out",
            MergeState::MergeAttempted => "merge_attempted",
            MergeState::Finished(MergeOutcome::Clean) => "clean",
            MergeState::Finished(MergeOutcome::Conflicted) => "conflicted",
            MergeState::Finished(MergeOutcome::FetchFailed) => "fetch_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::clone(MergeState::Init, MergeState::Cloned, true)]
    #[case::skip_checkout(MergeState::Cloned, MergeState::MergeAttempted, false)]
    #[case::clean(MergeState::MergeAttempted, MergeState::Finished(MergeOutcome::Clean), true)]
    #[case::conflicted(MergeState::MergeAttempted, MergeState::Finished(MergeOutcome::Conflicted), true)]
    #[case::fetch_after_merge(MergeState::MergeAttempted, MergeState::Finished(MergeOutcome::FetchFailed), false)]
    #[case::fetch_on_clone(MergeState::Init, MergeState::Finished(MergeOutcome::FetchFailed), true)]
    #[case::clean_before_merge(MergeState::Cloned, MergeState::Finished(MergeOutcome::Clean), false)]
    #[case::leave_terminal(MergeState::Finished(MergeOutcome::Clean), MergeState::Init, false)]
    fn transitions(#[case] from: MergeState, #[case] to: MergeState, #[case] legal: bool) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn only_finished_is_terminal() {
        assert!(MergeState::Finished(MergeOutcome::Conflicted).is_terminal());
        assert!(!MergeState::MergeAttempted.is_terminal());
    }
}
