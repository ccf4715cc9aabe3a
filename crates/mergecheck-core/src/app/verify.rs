//! BuildVerifier: runs the build command in a merged tree and classifies it.
//!
//! The exit status is the only input to the verdict. Output is captured for
//! the record, never parsed.

use std::time::Duration;

use crate::domain::EnvironmentError;
use crate::ports::Environment;

use super::environment::EnvironmentManager;

/// Default bound on the recorded build output (64 KiB).
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Verdict of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub success: bool,
    /// Tail of the combined stdout/stderr.
    pub output: String,
    /// `None` when the build timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BuildVerifier {
    output_limit: usize,
}

impl Default for BuildVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT)
    }
}

impl BuildVerifier {
    pub fn new(output_limit: usize) -> Self {
        Self { output_limit }
    }

    pub fn output_limit(&self) -> usize {
        self.output_limit
    }

    /// Runs `command` in the environment's workdir.
    ///
    /// A nonzero exit or a timeout is a failed build, not an error. Errors are
    /// reserved for the environment failing to run the command at all.
    pub async fn verify(
        &self,
        envs: &EnvironmentManager,
        env: &Environment,
        command: &str,
        timeout: Duration,
    ) -> Result<BuildReport, EnvironmentError> {
        if timeout.is_zero() {
            tracing::warn!(instance = %env.instance_id, "no time left for the build");
            return Ok(BuildReport {
                success: false,
                output: String::new(),
                exit_code: None,
                timed_out: true,
                duration: Duration::ZERO,
            });
        }

        let result = envs.exec(env, command, None, timeout).await?;
        let report = BuildReport {
            success: result.succeeded(),
            output: tail_excerpt(&result.combined_output(), self.output_limit),
            exit_code: result.exit_code(),
            timed_out: result.timed_out(),
            duration: result.duration,
        };
        tracing::debug!(
            instance = %env.instance_id,
            success = report.success,
            exit_code = ?report.exit_code,
            timed_out = report.timed_out,
            elapsed_ms = report.duration.as_millis() as u64,
            "build finished"
        );
        Ok(report)
    }
}

/// Keeps at most `limit` bytes of `output`: its tail (on a char boundary),
/// prefixed with a marker when anything was dropped. The marker counts
/// toward `limit`; below the marker's own size the tail goes unmarked.
pub fn tail_excerpt(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut start = char_start(output, output.len() - limit);
    loop {
        let marker = format!("[... {start} bytes truncated ...]\n");
        if marker.len() > limit {
            return output[char_start(output, output.len() - limit)..].to_string();
        }
        let needed = output.len() + marker.len() - limit;
        if start >= needed {
            return marker + &output[start..];
        }
        start = char_start(output, needed);
    }
}

/// First char boundary at or after `index`.
fn char_start(s: &str, mut index: usize) -> usize {
    while !s.is_char_boundary(index) {
        index += 1;
    }
    index
}
