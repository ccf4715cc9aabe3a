//! App: the components that drive one verification.
//!
//! # Components
//! - **EnvironmentManager**: environment lifecycle, image cache, orphan cleanup
//! - **MergeSimulator**: clone, fetch and test-merge inside an environment
//! - **BuildVerifier**: build command execution with a bounded excerpt
//! - **Orchestrator**: batch execution (locks, bounded concurrency, retries)
//! - **OrchestratorBuilder**: wiring and start-up validation
//! - **TaskGenerator**: tasks from change-request metadata

pub mod builder;
pub mod environment;
pub mod generate;
pub mod merge;
pub mod orchestrator;
pub mod retry;
pub mod summary;
pub mod verify;

pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::environment::{EnvironmentGuard, EnvironmentManager};
pub use self::generate::{GenerateOptions, ProjectType, TaskGenerator, task_from_change_request};
pub use self::merge::{GitIdentity, MergeReport, MergeSimulator};
pub use self::orchestrator::{Orchestrator, RunConfig, ShutdownHandle, TaskSelector};
pub use self::retry::{Decider, Decision, DefaultDecider, RetryPolicy};
pub use self::summary::{BatchReport, BatchSummary, SkipReason, Skipped};
pub use self::verify::{BuildReport, BuildVerifier};
