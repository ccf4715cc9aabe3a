//! Errors and their operational classification.
//!
//! Outcomes such as a conflicted merge, a failed fetch or a failed build are
//! not errors; they are recorded in `ResultRecord`. The types here cover
//! faults of the machinery around them.

use std::path::PathBuf;

use super::ids::TaskKey;
use super::outcome::FailureClass;

/// Operational classification of a failure.
///
/// - Transient: retry may help (network blips, flaky daemons)
/// - Permanent: retrying is pointless (bad input, missing task)
/// - Infrastructure: the host or environment runtime is unhealthy; retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// The environment runtime could not build, start or drive an environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("image build failed for {image}: {detail}")]
    ImageBuild { image: String, detail: String },

    #[error("failed to start environment {instance}: {detail}")]
    Start { instance: String, detail: String },

    #[error("command could not be executed in {instance}: {detail}")]
    Exec { instance: String, detail: String },

    #[error("file transfer failed for {path} in {instance}: {detail}")]
    Transfer {
        instance: String,
        path: String,
        detail: String,
    },

    #[error("environment {instance} is not active")]
    NotActive { instance: String },

    #[error("environment runtime unavailable: {0}")]
    Unavailable(String),

    #[error("io error talking to environment runtime: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvironmentError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Infrastructure
    }
}

/// Faults during merge simulation that are not merge outcomes.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("network error during {step}: {detail}")]
    Network { step: &'static str, detail: String },

    #[error("infrastructure error during {step}: {detail}")]
    Infra { step: &'static str, detail: String },

    #[error("merge phase timed out during {step}")]
    Timeout { step: &'static str },

    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

impl MergeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MergeError::Network { .. } | MergeError::Timeout { .. } => ErrorKind::Transient,
            MergeError::Infra { .. } | MergeError::Environment(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            MergeError::Network { .. } => FailureClass::Network,
            MergeError::Infra { .. } | MergeError::Timeout { .. } => FailureClass::Infra,
            MergeError::Environment(_) => FailureClass::Environment,
        }
    }
}

/// Persistence faults.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskKey),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("lock for {key} is not owned by this run")]
    NotOwner { key: TaskKey },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage worker failed: {0}")]
    Join(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) | StoreError::AlreadyExists(_) | StoreError::NotOwner { .. } => {
                ErrorKind::Permanent
            }
            StoreError::Io { .. } | StoreError::Serde { .. } | StoreError::Join(_) => {
                ErrorKind::Infrastructure
            }
        }
    }
}

/// Task generation faults.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("not a change request reference: {0}")]
    InvalidReference(String),

    #[error("no metadata for change request {0}")]
    NotFound(String),

    #[error("unknown project type: {0}")]
    UnknownProjectType(String),

    #[error("cannot choose a build command for {0}: project type not detected")]
    NoBuildCommand(TaskKey),

    #[error("metadata source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Faults that stop a whole batch before or while planning it.
///
/// Per-task faults never surface here; they end up in the batch report.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid task filter {pattern:?}: {detail}")]
    InvalidFilter { pattern: String, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {var}: {detail}")]
    Env {
        var: &'static str,
        value: String,
        detail: String,
    },

    #[error("invalid setting {field}: {detail}")]
    Invalid { field: &'static str, detail: String },
}
