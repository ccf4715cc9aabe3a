//! Task definition: one persisted verification unit.
//!
//! A task is read-only to the core once generated. Regenerating a task with the
//! same key replaces its definition but never touches results already recorded.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::TaskKey;

/// A branch name pinned to an exact commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRef {
    pub branch: String,
    pub commit: String,
}

impl GitRef {
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit: commit.into(),
        }
    }
}

/// Resource limits for the environment an attempt runs in.
///
/// Defaults:
/// - `cpus`: 2
/// - `memory_mb`: 4096
/// - `timeout_sec`: 1800 (whole attempt, merge + build)
/// - `merge_timeout_sec`: 300 (merge phase share, clamped to `timeout_sec`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpus: u32,
    pub memory_mb: u64,
    pub timeout_sec: u64,
    pub merge_timeout_sec: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 4096,
            timeout_sec: 1800,
            merge_timeout_sec: 300,
        }
    }
}

/// Per-phase wall clock budgets. `merge + build == total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBudgets {
    pub merge: Duration,
    pub build: Duration,
}

impl ResourceLimits {
    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    /// Splits the total timeout into merge and build budgets.
    pub fn phase_budgets(&self) -> PhaseBudgets {
        let merge = self.merge_timeout_sec.min(self.timeout_sec);
        PhaseBudgets {
            merge: Duration::from_secs(merge),
            build: Duration::from_secs(self.timeout_sec - merge),
        }
    }
}

/// Whether the environment may reach the network during the attempt.
///
/// Default: allowed (clones and dependency downloads need it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub allowed: bool,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self { allowed: true }
    }
}

/// Definition of the image an environment is started from.
///
/// Two specs with the same content share one image; the cache key is the
/// SHA-256 of the rendered definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub base_image: String,

    /// Shell commands run once while building the image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,
}

impl ImageSpec {
    pub fn new(base_image: impl Into<String>) -> Self {
        Self {
            base_image: base_image.into(),
            setup: Vec::new(),
        }
    }

    /// Renders the image definition as a Dockerfile.
    pub fn render(&self) -> String {
        let mut out = format!("FROM {}\n", self.base_image);
        for step in &self.setup {
            out.push_str("RUN ");
            out.push_str(step);
            out.push('\n');
        }
        out.push_str("WORKDIR /workspace\n");
        out
    }

    /// Hex SHA-256 of the rendered definition.
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(self.render().as_bytes()))
    }
}

/// A persisted verification unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,

    /// Repository the change is merged into.
    pub repo_url: String,

    /// Repository the change comes from, when it lives in a fork.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo_url: Option<String>,

    pub target: GitRef,
    pub source: GitRef,

    pub build_command: String,
    pub image: ImageSpec,

    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub network: NetworkPolicy,

    /// Project type label the task was generated for (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
}

impl Task {
    /// URL the source branch is fetched from.
    pub fn source_url(&self) -> &str {
        self.source_repo_url.as_deref().unwrap_or(&self.repo_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(ResourceLimits::default(), 300, 1500)]
    #[case::merge_share_clamped(ResourceLimits { timeout_sec: 120, ..Default::default() }, 120, 0)]
    #[case::custom(ResourceLimits { timeout_sec: 600, merge_timeout_sec: 60, ..Default::default() }, 60, 540)]
    fn phase_budgets_sum_to_total(
        #[case] limits: ResourceLimits,
        #[case] merge: u64,
        #[case] build: u64,
    ) {
        let budgets = limits.phase_budgets();
        assert_eq!(budgets.merge, Duration::from_secs(merge));
        assert_eq!(budgets.build, Duration::from_secs(build));
        assert_eq!(budgets.merge + budgets.build, limits.total_timeout());
    }

    #[test]
    fn image_hash_depends_only_on_content() {
        let a = ImageSpec {
            base_image: "rust:latest".into(),
            setup: vec!["apt-get update".into()],
        };
        let b = a.clone();
        let mut c = a.clone();
        c.setup.push("apt-get install -y git".into());

        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn missing_limits_fall_back_to_defaults() {
        let json = r#"{
            "key": "o_r_1",
            "repo_url": "https://example.invalid/o/r.git",
            "target": {"branch": "main", "commit": "aaa"},
            "source": {"branch": "feature", "commit": "bbb"},
            "build_command": "make",
            "image": {"base_image": "debian:bookworm"},
            "limits": {"cpus": 4}
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();

        assert_eq!(task.limits.cpus, 4);
        assert_eq!(task.limits.memory_mb, 4096);
        assert!(task.network.allowed);
        assert_eq!(task.source_url(), "https://example.invalid/o/r.git");
    }
}
