//! Environment backend port: the capability interface to an isolation runtime.
//!
//! The orchestrator and the merge simulator only see this trait (through
//! `app::environment::EnvironmentManager`). Concrete runtimes live in `impls`:
//! - `DockerBackend`: containers driven through the docker CLI
//! - `LocalBackend`: host processes in a scratch directory per instance
//! - `ScriptedBackend`: in-process fake with fault injection

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{EnvironmentError, ImageSpec, NetworkPolicy, ResourceLimits};

/// What an attempt needs from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRequest {
    /// Human-readable owner (task key), used in logs and instance labels.
    pub label: String,
    pub image: ImageSpec,
    pub limits: ResourceLimits,
    pub network: NetworkPolicy,
}

/// Handle to a started environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub instance_id: String,
    pub image_ref: String,
    /// Directory commands run in by default; the merge simulator clones here.
    pub workdir: String,
}

/// Lifecycle of an instance, tracked by the instance registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Starting,
    Ready,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    /// The command was killed after exceeding its timeout.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExecStatus::Exited(code) => Some(code),
            ExecStatus::TimedOut => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecStatus::Exited(0)
    }

    pub fn timed_out(&self) -> bool {
        self.status == ExecStatus::TimedOut
    }

    /// stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }
}

/// Capability interface of an isolation runtime.
///
/// # Contract
/// - `prepare_image` is called at most once per image content hash per batch;
///   the manager serializes concurrent callers
/// - `start` must either return a ready environment or leave nothing running
///   under `instance_id` that `stop` could not reclaim
/// - `exec` kills the command on timeout and returns `ExecStatus::TimedOut`
/// - `stop` is idempotent; stopping an unknown instance is not an error
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds (or finds) the image for `image` and returns its reference.
    async fn prepare_image(&self, image: &ImageSpec, tag: &str) -> Result<String, EnvironmentError>;

    async fn start(
        &self,
        instance_id: &str,
        image_ref: &str,
        request: &EnvironmentRequest,
    ) -> Result<Environment, EnvironmentError>;

    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, EnvironmentError>;

    async fn upload_file(
        &self,
        env: &Environment,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EnvironmentError>;

    async fn download_file(&self, env: &Environment, path: &str) -> Result<Vec<u8>, EnvironmentError>;

    async fn stop(&self, instance_id: &str) -> Result<(), EnvironmentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(stdout: &str, stderr: &str, status: ExecStatus) -> ExecResult {
        ExecResult {
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn combined_output_joins_streams() {
        assert_eq!(exec("a", "b", ExecStatus::Exited(0)).combined_output(), "a\nb");
        assert_eq!(exec("a\n", "", ExecStatus::Exited(0)).combined_output(), "a\n");
        assert_eq!(exec("", "b", ExecStatus::Exited(1)).combined_output(), "b");
    }

    #[test]
    fn timed_out_has_no_exit_code() {
        let result = exec("", "", ExecStatus::TimedOut);
        assert!(result.timed_out());
        assert!(!result.succeeded());
        assert_eq!(result.exit_code(), None);
    }
}
