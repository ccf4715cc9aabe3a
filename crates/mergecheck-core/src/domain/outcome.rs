//! Outcome model: what a merge simulation produced.
//!
//! `MergeOutcome` is what the merge simulator can conclude on its own.
//! `MergeStatus` is what gets recorded, and adds `InfraError` for attempts
//! where the merge phase never reached a conclusion.

use serde::{Deserialize, Serialize};

/// Terminal result of a merge simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeOutcome {
    /// Merge applied with no unmerged paths.
    Clean,
    /// Merge left unmerged paths. The tree (with markers) still goes to the build.
    Conflicted,
    /// Refs or commits could not be obtained. The build is skipped.
    FetchFailed,
}

impl MergeOutcome {
    /// Whether the build step runs after this outcome.
    pub fn proceeds_to_build(self) -> bool {
        !matches!(self, MergeOutcome::FetchFailed)
    }
}

/// Merge outcome as stored in a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeStatus {
    Clean,
    Conflicted,
    FetchFailed,
    InfraError,
}

impl From<MergeOutcome> for MergeStatus {
    fn from(outcome: MergeOutcome) -> Self {
        match outcome {
            MergeOutcome::Clean => MergeStatus::Clean,
            MergeOutcome::Conflicted => MergeStatus::Conflicted,
            MergeOutcome::FetchFailed => MergeStatus::FetchFailed,
        }
    }
}

/// Why an attempt did not produce a normal build verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The environment could not be built, started or driven.
    Environment,
    /// Network fault while fetching refs.
    Network,
    /// Other infrastructure fault (disk, git crash, merge phase timeout).
    Infra,
    /// Refs or commits do not exist or are not accessible.
    Fetch,
    /// The build exceeded its time budget.
    Timeout,
}
