//! Settings: TOML file, then `MERGECHECK_*` environment overrides.
//!
//! # Precedence (lowest first)
//! 1. built-in defaults
//! 2. the config file (`--config`, or `<data_dir>/mergecheck.toml` when present)
//! 3. environment variables
//! 4. command-line flags (applied by the binary)
//!
//! ```toml
//! data_dir = "/var/lib/mergecheck"
//! backend = "docker"
//!
//! [run]
//! concurrency = 8
//! max_attempts = 3
//!
//! [limits]
//! timeout_sec = 3600
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{RetryPolicy, RunConfig};
use crate::domain::{ConfigError, ResourceLimits};
use crate::impls::DockerConfig;

pub const CONFIG_FILE: &str = "mergecheck.toml";

pub const ENV_CONCURRENCY: &str = "MERGECHECK_CONCURRENCY";
pub const ENV_TIMEOUT_SEC: &str = "MERGECHECK_TIMEOUT_SEC";
pub const ENV_DATA_DIR: &str = "MERGECHECK_DATA_DIR";
pub const ENV_BACKEND: &str = "MERGECHECK_BACKEND";

/// Environment backend selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    /// Scratch directories on the host; no isolation.
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Docker => "docker",
            BackendKind::Local => "local",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "local" => Ok(BackendKind::Local),
            other => Err(format!("unknown backend {other:?} (expected docker or local)")),
        }
    }
}

/// Orchestrator knobs, in file-friendly units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub heartbeat_interval_sec: u64,
    pub stale_after_sec: u64,
    pub output_limit_bytes: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        let run = RunConfig::default();
        Self {
            concurrency: run.concurrency,
            max_attempts: run.max_attempts,
            retry_base_delay_ms: run.retry_policy.base_delay.as_millis() as u64,
            retry_multiplier: run.retry_policy.multiplier,
            heartbeat_interval_sec: run.heartbeat_interval.as_secs(),
            stale_after_sec: run.stale_after.as_secs(),
            output_limit_bytes: run.output_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSettings {
    pub binary: String,
    pub image_prefix: String,
    pub build_timeout_sec: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        let docker = DockerConfig::default();
        Self {
            binary: docker.binary,
            image_prefix: docker.image_prefix,
            build_timeout_sec: docker.build_timeout.as_secs(),
        }
    }
}

/// Everything the binary needs to wire a run.
///
/// `limits` are the defaults stamped on generated tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub backend: BackendKind,
    pub run: RunSettings,
    pub limits: ResourceLimits,
    pub docker: DockerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".mergecheck"),
            backend: BackendKind::default(),
            run: RunSettings::default(),
            limits: ResourceLimits::default(),
            docker: DockerSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from the process environment.
    ///
    /// `explicit` must exist; the default file under the data directory is
    /// optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(explicit, |var| std::env::var(var).ok())
    }

    /// Like `load`, reading variables through `lookup`.
    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match explicit {
            Some(path) => Self::read_file(path)?,
            None => {
                let data_dir = lookup(ENV_DATA_DIR)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| Settings::default().data_dir);
                let path = data_dir.join(CONFIG_FILE);
                if path.is_file() {
                    Self::read_file(&path)?
                } else {
                    Settings::default()
                }
            }
        };
        settings.apply_env(lookup)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CONCURRENCY) {
            self.run.concurrency = parse_env(ENV_CONCURRENCY, value)?;
        }
        if let Some(value) = lookup(ENV_TIMEOUT_SEC) {
            self.limits.timeout_sec = parse_env(ENV_TIMEOUT_SEC, value)?;
        }
        if let Some(value) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_BACKEND) {
            let parsed = value.parse::<BackendKind>();
            self.backend = parsed.map_err(|detail| ConfigError::Env {
                var: ENV_BACKEND,
                value,
                detail,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.concurrency == 0 {
            return invalid("run.concurrency", "must be at least 1");
        }
        if self.run.max_attempts == 0 {
            return invalid("run.max_attempts", "must be at least 1");
        }
        if !(self.run.retry_multiplier.is_finite() && self.run.retry_multiplier >= 1.0) {
            return invalid("run.retry_multiplier", "must be a finite number >= 1");
        }
        if self.run.heartbeat_interval_sec == 0
            || self.run.heartbeat_interval_sec >= self.run.stale_after_sec
        {
            return invalid(
                "run.heartbeat_interval_sec",
                "must be nonzero and below run.stale_after_sec",
            );
        }
        if self.limits.timeout_sec == 0 {
            return invalid("limits.timeout_sec", "must be at least 1");
        }
        if self.limits.cpus == 0 || self.limits.memory_mb == 0 {
            return invalid("limits", "cpus and memory_mb must be nonzero");
        }
        Ok(())
    }

    pub fn run_config(&self, force: bool) -> RunConfig {
        RunConfig {
            concurrency: self.run.concurrency,
            max_attempts: self.run.max_attempts,
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(self.run.retry_base_delay_ms),
                multiplier: self.run.retry_multiplier,
            },
            heartbeat_interval: Duration::from_secs(self.run.heartbeat_interval_sec),
            stale_after: Duration::from_secs(self.run.stale_after_sec),
            force,
            output_limit: self.run.output_limit_bytes,
        }
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            binary: self.docker.binary.clone(),
            image_prefix: self.docker.image_prefix.clone(),
            build_timeout: Duration::from_secs(self.docker.build_timeout_sec),
            ..DockerConfig::default()
        }
    }
}

fn invalid(field: &'static str, detail: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid {
        field,
        detail: detail.to_string(),
    })
}

fn parse_env<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|e| ConfigError::Env {
        var,
        detail: e.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_match_run_config() {
        let settings = Settings::default();
        let run = settings.run_config(false);
        assert_eq!(run.concurrency, 4);
        assert_eq!(run.max_attempts, 3);
        assert_eq!(run.retry_policy, RetryPolicy::default());
        assert_eq!(run.stale_after, Duration::from_secs(600));
        assert_eq!(settings.backend, BackendKind::Docker);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "backend = \"local\"\n[run]\nconcurrency = 8\n[limits]\ntimeout_sec = 60\n",
        )
        .unwrap();

        let settings = Settings::load_with(Some(&path), env(&[])).unwrap();
        assert_eq!(settings.backend, BackendKind::Local);
        assert_eq!(settings.run.concurrency, 8);
        assert_eq!(settings.run.max_attempts, 3);
        assert_eq!(settings.limits.timeout_sec, 60);
        assert_eq!(settings.limits.memory_mb, 4096);
    }

    #[test]
    fn environment_overrides_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[run]\nconcurrency = 8\n").unwrap();
        let data_dir = dir.path().to_string_lossy().into_owned();

        let settings = Settings::load_with(
            None,
            env(&[
                (ENV_DATA_DIR, &data_dir),
                (ENV_CONCURRENCY, "2"),
                (ENV_TIMEOUT_SEC, "900"),
                (ENV_BACKEND, "Local"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.data_dir, dir.path());
        assert_eq!(settings.run.concurrency, 2);
        assert_eq!(settings.limits.timeout_sec, 900);
        assert_eq!(settings.backend, BackendKind::Local);
    }

    #[test]
    fn missing_default_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("empty").to_string_lossy().into_owned();
        let settings = Settings::load_with(None, env(&[(ENV_DATA_DIR, &data_dir)])).unwrap();
        assert_eq!(settings.run, RunSettings::default());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load_with(Some(&dir.path().join("nope.toml")), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.toml");
        std::fs::write(&path, "[run]\nconcurency = 8\n").unwrap();
        let err = Settings::load_with(Some(&path), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn malformed_environment_value_names_the_variable() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[(ENV_CONCURRENCY, "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_CONCURRENCY, .. }));
        assert!(err.to_string().contains("many"));
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let err = Settings::load_with(
            None,
            env(&[(ENV_DATA_DIR, "/nonexistent"), (ENV_CONCURRENCY, "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "run.concurrency", .. }));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut settings = Settings::default();
        let err = settings.apply_env(env(&[(ENV_BACKEND, "podman")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_BACKEND, .. }));
    }
}
