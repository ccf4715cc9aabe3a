//! OrchestratorBuilder: wiring and start-up validation.
//!
//! Fail-fast: `build()` refuses missing components and settings that could
//! only fail later, in the middle of a batch.

use std::sync::Arc;

use crate::ports::{
    Clock, EnvironmentBackend, IdGenerator, LockStore, ResultStore, SystemClock, TaskStore,
    UlidGenerator,
};

use super::merge::{GitIdentity, MergeSimulator};
use super::orchestrator::{Orchestrator, RunConfig, Shared};
use super::retry::{Decider, DefaultDecider};
use super::verify::BuildVerifier;

/// Builds an `Orchestrator`.
///
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new()
///     .stores(Arc::new(FsStore::open(data_dir)?))
///     .backend(Arc::new(DockerBackend::new(DockerConfig::default())))
///     .config(RunConfig { concurrency: 8, ..Default::default() })
///     .build()?;
/// ```
#[derive(Default)]
pub struct OrchestratorBuilder {
    tasks: Option<Arc<dyn TaskStore>>,
    results: Option<Arc<dyn ResultStore>>,
    locks: Option<Arc<dyn LockStore>>,
    backend: Option<Arc<dyn EnvironmentBackend>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    identity: GitIdentity,
    config: RunConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error("invalid run config: {0}")]
    InvalidConfig(String),
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses one store for tasks, results and locks.
    pub fn stores<S>(self, store: Arc<S>) -> Self
    where
        S: TaskStore + ResultStore + LockStore + 'static,
    {
        self.task_store(store.clone())
            .result_store(store.clone())
            .lock_store(store)
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(store);
        self
    }

    pub fn result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.results = Some(store);
        self
    }

    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.locks = Some(store);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn EnvironmentBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to ULIDs stamped by the configured clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to `DefaultDecider` over the config's retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn git_identity(mut self, identity: GitIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// # Validation
    /// - stores and backend are set
    /// - concurrency and max attempts are at least 1
    /// - the heartbeat interval is nonzero and shorter than the stale period
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        let tasks = self.tasks.ok_or(BuildError::MissingComponent("task store"))?;
        let results = self.results.ok_or(BuildError::MissingComponent("result store"))?;
        let locks = self.locks.ok_or(BuildError::MissingComponent("lock store"))?;
        let backend = self
            .backend
            .ok_or(BuildError::MissingComponent("environment backend"))?;

        let config = self.config;
        if config.concurrency == 0 {
            return Err(BuildError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if config.max_attempts == 0 {
            return Err(BuildError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if config.heartbeat_interval.is_zero() || config.heartbeat_interval >= config.stale_after {
            return Err(BuildError::InvalidConfig(format!(
                "heartbeat interval {:?} must be nonzero and below the stale period {:?}",
                config.heartbeat_interval, config.stale_after
            )));
        }
        let stale_after = chrono::Duration::from_std(config.stale_after)
            .map_err(|e| BuildError::InvalidConfig(format!("stale period: {e}")))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(DefaultDecider::new(
                config.retry_policy.clone(),
                config.max_attempts,
            ))
        });

        Ok(Orchestrator::from_shared(Shared {
            tasks,
            results,
            locks,
            backend,
            clock,
            ids,
            decider,
            merge: MergeSimulator::new(self.identity),
            verifier: BuildVerifier::new(config.output_limit),
            stale_after,
            config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::impls::{InMemoryStore, ScriptedBackend};

    fn complete() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
            .stores(Arc::new(InMemoryStore::new()))
            .backend(Arc::new(ScriptedBackend::new()))
    }

    #[test]
    fn builds_with_defaults() {
        let orchestrator = complete().build().unwrap();
        assert_eq!(orchestrator.config().concurrency, 4);
    }

    #[test]
    fn missing_backend_is_reported() {
        let err = OrchestratorBuilder::new()
            .stores(Arc::new(InMemoryStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::MissingComponent("environment backend")));
    }

    #[test]
    fn missing_stores_are_reported() {
        let err = OrchestratorBuilder::new()
            .backend(Arc::new(ScriptedBackend::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::MissingComponent("task store")));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = complete()
            .config(RunConfig {
                concurrency: 0,
                ..Default::default()
            })
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::InvalidConfig(_)));
    }

    #[test]
    fn heartbeat_must_be_shorter_than_stale_period() {
        let err = complete()
            .config(RunConfig {
                heartbeat_interval: Duration::from_secs(600),
                stale_after: Duration::from_secs(60),
                ..Default::default()
            })
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("heartbeat interval"));
    }
}
