//! Domain identifiers (strongly-typed IDs).
//!
//! Two families live here:
//! - `TaskKey`: the stable, human-readable identity of a verification unit,
//!   derived from the repository and change-request number. Used as a storage key.
//! - `Id<T>`: ULID-based ids for runs and attempts. ULIDs sort by creation
//!   time, so ordering attempts by id orders them chronologically.
//!
//! `Id<T>` uses a phantom marker type so that a `RunId` can never be passed
//! where an `AttemptId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id family.
///
/// Provides the prefix used by `Display` ("run-", "attempt-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID id.
///
/// Serialized as the prefixed string form, e.g. `"attempt-01HV..."`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when parsing a prefixed id string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id {value:?}: expected {prefix}<ulid>")]
pub struct ParseIdError {
    value: String,
    prefix: &'static str,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError {
            value: s.to_string(),
            prefix: T::prefix(),
        };
        let raw = s.strip_prefix(T::prefix()).ok_or_else(err)?;
        let ulid = Ulid::from_string(raw).map_err(|_| err())?;
        Ok(Self::from_ulid(ulid))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Run (one orchestrator invocation) marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

/// Attempt (one execution try of a task) marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attempt {}

impl IdMarker for Attempt {
    fn prefix() -> &'static str {
        "attempt-"
    }
}

/// Identifier of one batch run. Owns LockStates while it runs.
pub type RunId = Id<Run>;

/// Identifier of an attempt. Distinct per retry.
pub type AttemptId = Id<Attempt>;

/// Stable identity of a verification task.
///
/// Format: `{owner}_{repo}_{number}`, with characters outside
/// `[A-Za-z0-9._-]` replaced by `-` so the key is safe as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    /// Derives the key for change request `number` of `owner/repo`.
    pub fn for_change_request(owner: &str, repo: &str, number: u64) -> Self {
        Self(format!(
            "{}_{}_{number}",
            sanitize(owner),
            sanitize(repo)
        ))
    }

    /// Wraps an existing key (e.g. read back from storage or the command line).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(sanitize(&raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        let run = RunId::from_ulid(Ulid::new());
        let attempt = AttemptId::from_ulid(Ulid::new());

        assert!(run.to_string().starts_with("run-"));
        assert!(attempt.to_string().starts_with("attempt-"));
        // let _: RunId = attempt; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_prefixed_strings() {
        let attempt = AttemptId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&attempt).unwrap();
        assert_eq!(json, format!("\"{attempt}\""));

        let back: AttemptId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attempt);
    }

    #[test]
    fn parsing_rejects_wrong_prefix() {
        let run = RunId::from_ulid(Ulid::new());
        let err = run.to_string().parse::<AttemptId>().unwrap_err();
        assert!(err.to_string().contains("attempt-"));
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = AttemptId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = AttemptId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn task_key_is_derived_from_repo_and_number() {
        let key = TaskKey::for_change_request("octo-org", "widgets", 42);
        assert_eq!(key.as_str(), "octo-org_widgets_42");
    }

    #[test]
    fn task_key_replaces_path_separators() {
        let key = TaskKey::for_change_request("a/b", "c d", 7);
        assert_eq!(key.as_str(), "a-b_c-d_7");
        assert_eq!(TaskKey::new("../etc"), TaskKey::new("..-etc"));
    }
}
