//! EnvironmentManager: lifecycle of isolated environments for one batch.
//!
//! # Responsibilities
//! - image cache: one image per content hash, built at most once even when
//!   several attempts acquire concurrently
//! - instance registry: every instance started in this batch and its state
//! - guaranteed release: `EnvironmentGuard` releases on explicit `release()`,
//!   and schedules a release when dropped without one (cancellation, panic)
//!
//! The manager is created per batch and torn down with `teardown()` when the
//! batch ends; nothing here is process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::domain::EnvironmentError;
use crate::ports::{
    Environment, EnvironmentBackend, EnvironmentRequest, EnvironmentState, ExecResult, ExecStatus,
};

/// Extra time granted to a backend beyond the command timeout before the
/// manager stops waiting for it.
const EXEC_SLACK: Duration = Duration::from_secs(30);

/// Length of the content-hash prefix used as image tag.
const IMAGE_TAG_LEN: usize = 16;

#[derive(Default)]
struct InstanceRegistry {
    instances: Mutex<HashMap<String, EnvironmentState>>,
    images: tokio::sync::Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl InstanceRegistry {
    fn instances(&self) -> MutexGuard<'_, HashMap<String, EnvironmentState>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, instance_id: &str, state: EnvironmentState) {
        self.instances().insert(instance_id.to_string(), state);
    }

    fn get(&self, instance_id: &str) -> Option<EnvironmentState> {
        self.instances().get(instance_id).copied()
    }

    async fn image_cell(&self, hash: &str) -> Arc<OnceCell<String>> {
        let mut images = self.images.lock().await;
        Arc::clone(images.entry(hash.to_string()).or_default())
    }
}

struct ManagerInner {
    backend: Arc<dyn EnvironmentBackend>,
    registry: InstanceRegistry,
}

/// Batch-scoped environment manager. Cloning shares the registry.
#[derive(Clone)]
pub struct EnvironmentManager {
    inner: Arc<ManagerInner>,
}

impl EnvironmentManager {
    pub fn new(backend: Arc<dyn EnvironmentBackend>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                registry: InstanceRegistry::default(),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Starts an environment for `request` under `instance_id`.
    ///
    /// Fails with `EnvironmentError` when the image cannot be prepared or the
    /// instance cannot start. Nothing is retried here. Whatever a failed start
    /// left behind is released before the error is returned.
    pub async fn acquire(
        &self,
        instance_id: &str,
        request: &EnvironmentRequest,
    ) -> Result<EnvironmentGuard, EnvironmentError> {
        let image_ref = self.image_for(request).await?;

        self.inner
            .registry
            .set(instance_id, EnvironmentState::Starting);
        match self
            .inner
            .backend
            .start(instance_id, &image_ref, request)
            .await
        {
            Ok(env) => {
                self.inner.registry.set(instance_id, EnvironmentState::Ready);
                tracing::debug!(
                    instance = instance_id,
                    image = %image_ref,
                    task = %request.label,
                    "environment ready"
                );
                Ok(EnvironmentGuard {
                    manager: self.clone(),
                    env,
                    released: false,
                })
            }
            Err(err) => {
                tracing::warn!(instance = instance_id, error = %err, "environment start failed");
                self.release(instance_id).await;
                Err(err)
            }
        }
    }

    async fn image_for(&self, request: &EnvironmentRequest) -> Result<String, EnvironmentError> {
        let hash = request.image.content_hash();
        let tag = &hash[..IMAGE_TAG_LEN];
        let cell = self.inner.registry.image_cell(&hash).await;
        let image_ref = cell
            .get_or_try_init(|| self.inner.backend.prepare_image(&request.image, tag))
            .await?;
        Ok(image_ref.clone())
    }

    fn ensure_ready(&self, env: &Environment) -> Result<(), EnvironmentError> {
        match self.inner.registry.get(&env.instance_id) {
            Some(EnvironmentState::Ready) => Ok(()),
            _ => Err(EnvironmentError::NotActive {
                instance: env.instance_id.clone(),
            }),
        }
    }

    /// Runs `command` in `env`. A command exceeding `timeout` is killed and
    /// reported as `ExecStatus::TimedOut`.
    pub async fn exec(
        &self,
        env: &Environment,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, EnvironmentError> {
        self.ensure_ready(env)?;
        tracing::trace!(instance = %env.instance_id, command, "exec");
        let run = self.inner.backend.exec(env, command, cwd, timeout);
        match tokio::time::timeout(timeout + EXEC_SLACK, run).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(instance = %env.instance_id, "backend did not return after timeout");
                Ok(ExecResult {
                    status: ExecStatus::TimedOut,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: timeout,
                })
            }
        }
    }

    pub async fn upload_file(
        &self,
        env: &Environment,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EnvironmentError> {
        self.ensure_ready(env)?;
        self.inner.backend.upload_file(env, path, contents).await
    }

    pub async fn download_file(&self, env: &Environment, path: &str) -> Result<Vec<u8>, EnvironmentError> {
        self.ensure_ready(env)?;
        self.inner.backend.download_file(env, path).await
    }

    /// Stops and reclaims `instance_id`.
    ///
    /// Idempotent and infallible: releasing an unknown or already released
    /// instance does nothing, backend errors are logged. An instance whose
    /// stop failed stays registered so `teardown` can try again.
    pub async fn release(&self, instance_id: &str) {
        let previous = self.inner.registry.get(instance_id);
        if previous == Some(EnvironmentState::Released) {
            return;
        }
        match self.inner.backend.stop(instance_id).await {
            Ok(()) => {
                self.inner
                    .registry
                    .set(instance_id, EnvironmentState::Released);
                tracing::debug!(instance = instance_id, "environment released");
            }
            Err(err) => {
                tracing::warn!(instance = instance_id, error = %err, "environment release failed");
            }
        }
    }

    /// Instances not yet released.
    pub fn live_instances(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .inner
            .registry
            .instances()
            .iter()
            .filter(|(_, state)| **state != EnvironmentState::Released)
            .map(|(id, _)| id.clone())
            .collect();
        live.sort();
        live
    }

    pub fn state(&self, instance_id: &str) -> Option<EnvironmentState> {
        self.inner.registry.get(instance_id)
    }

    /// Releases every instance still registered. Called at batch end.
    pub async fn teardown(&self) {
        let live = self.live_instances();
        if !live.is_empty() {
            tracing::info!(count = live.len(), "releasing leftover environments");
        }
        for instance_id in live {
            self.release(&instance_id).await;
        }
    }
}

/// Scoped ownership of one environment.
///
/// Call `release().await` on every normal path. If the guard is dropped
/// unreleased (the owning future was cancelled or panicked), the release is
/// spawned onto the current runtime.
pub struct EnvironmentGuard {
    manager: EnvironmentManager,
    env: Environment,
    released: bool,
}

impl EnvironmentGuard {
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub async fn release(mut self) {
        self.released = true;
        self.manager.release(&self.env.instance_id).await;
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let instance_id = self.env.instance_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(instance = %instance_id, "releasing dropped environment");
                handle.spawn(async move { manager.release(&instance_id).await });
            }
            Err(_) => {
                tracing::warn!(instance = %instance_id, "environment dropped outside a runtime; left for teardown");
            }
        }
    }
}
