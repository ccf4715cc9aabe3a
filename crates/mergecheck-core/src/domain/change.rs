//! Change-request metadata: the input a task is generated from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::GenerateError;
use super::ids::TaskKey;
use super::task::GitRef;

/// Reference to a change request on a code-hosting service.
///
/// Parsed from URLs of the form `https://<host>/<owner>/<repo>/pull/<number>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl ChangeRequestRef {
    pub fn task_key(&self) -> TaskKey {
        TaskKey::for_change_request(&self.owner, &self.repo, self.number)
    }
}

impl fmt::Display for ChangeRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

impl FromStr for ChangeRequestRef {
    type Err = GenerateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GenerateError::InvalidReference(s.to_string());
        let trimmed = s.trim().trim_end_matches('/');
        let without_scheme = trimmed
            .split_once("://")
            .map_or(trimmed, |(_, rest)| rest);

        // host/owner/repo/pull/number[/...]
        let mut parts = without_scheme.split('/');
        let _host = parts.next().ok_or_else(invalid)?;
        let owner = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let repo = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        if parts.next() != Some("pull") {
            return Err(invalid());
        }
        let number = parts
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(invalid)?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.trim_end_matches(".git").to_string(),
            number,
        })
    }
}

/// Metadata of one change request, as yielded by a `ChangeRequestSource`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    #[serde(flatten)]
    pub reference: ChangeRequestRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    pub target_repo_url: String,

    /// Repository of the source branch; `None` when it is the target repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo_url: Option<String>,

    pub target: GitRef,
    pub source: GitRef,

    /// File names at the repository root, used for project type detection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_files: Vec<String>,
}
