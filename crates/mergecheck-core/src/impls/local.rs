//! Local backend: each environment is a scratch directory on the host.
//!
//! Commands run through `sh -c` in the instance directory. There is no
//! isolation beyond the filesystem: image setup, resource limits and the
//! network policy are not enforced. Useful for development and for tests that
//! need real git.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::domain::{EnvironmentError, ImageSpec};
use crate::ports::{Environment, EnvironmentBackend, EnvironmentRequest, ExecResult};

use super::process;

const HOST_IMAGE: &str = "host";

pub struct LocalBackend {
    root: PathBuf,
    instances: Mutex<HashMap<String, TempDir>>,
}

impl LocalBackend {
    /// Instances are created under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Instances are created under the system temp directory.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("mergecheck"))
    }

    pub fn live_instances(&self) -> usize {
        self.instances.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn instance_root(&self, instance_id: &str) -> Result<PathBuf, EnvironmentError> {
        let instances = self
            .instances
            .lock()
            .map_err(|_| EnvironmentError::Unavailable("instance table poisoned".into()))?;
        instances
            .get(instance_id)
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| EnvironmentError::NotActive {
                instance: instance_id.to_string(),
            })
    }

    /// Resolves `path` inside the instance: relative paths are relative to the
    /// workdir, absolute paths must stay inside the instance root.
    fn resolve(&self, env: &Environment, path: &str) -> Result<PathBuf, EnvironmentError> {
        let root = self.instance_root(&env.instance_id)?;
        let candidate = Path::new(path);
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            Path::new(&env.workdir).join(candidate)
        };
        let escapes = resolved
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes || !resolved.starts_with(&root) {
            return Err(EnvironmentError::Transfer {
                instance: env.instance_id.clone(),
                path: path.to_string(),
                detail: "path is outside the environment".into(),
            });
        }
        Ok(resolved)
    }
}

#[async_trait]
impl EnvironmentBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn prepare_image(&self, image: &ImageSpec, _tag: &str) -> Result<String, EnvironmentError> {
        if !image.setup.is_empty() {
            tracing::debug!(
                base_image = %image.base_image,
                "local backend runs on the host; image setup steps are skipped"
            );
        }
        Ok(HOST_IMAGE.to_string())
    }

    async fn start(
        &self,
        instance_id: &str,
        image_ref: &str,
        request: &EnvironmentRequest,
    ) -> Result<Environment, EnvironmentError> {
        let start_err = |detail: String| EnvironmentError::Start {
            instance: instance_id.to_string(),
            detail,
        };
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| start_err(e.to_string()))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{instance_id}-"))
            .tempdir_in(&self.root)
            .map_err(|e| start_err(e.to_string()))?;
        let workdir = dir.path().join("workspace");
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| start_err(e.to_string()))?;

        if !request.network.allowed {
            tracing::warn!(
                instance = instance_id,
                "local backend cannot restrict network access"
            );
        }

        self.instances
            .lock()
            .map_err(|_| start_err("instance table poisoned".into()))?
            .insert(instance_id.to_string(), dir);

        Ok(Environment {
            instance_id: instance_id.to_string(),
            image_ref: image_ref.to_string(),
            workdir: workdir.to_string_lossy().into_owned(),
        })
    }

    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, EnvironmentError> {
        let cwd = match cwd {
            Some(dir) => self.resolve(env, dir)?,
            None => {
                self.instance_root(&env.instance_id)?;
                PathBuf::from(&env.workdir)
            }
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&cwd);
        // git must never prompt for credentials
        cmd.env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_TERMINAL_PROMPT", "0");

        process::run(cmd, None, timeout)
            .await
            .map_err(|e| EnvironmentError::Exec {
                instance: env.instance_id.clone(),
                detail: e.to_string(),
            })
    }

    async fn upload_file(
        &self,
        env: &Environment,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EnvironmentError> {
        let target = self.resolve(env, path)?;
        let transfer_err = |e: std::io::Error| EnvironmentError::Transfer {
            instance: env.instance_id.clone(),
            path: path.to_string(),
            detail: e.to_string(),
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transfer_err)?;
        }
        tokio::fs::write(&target, contents).await.map_err(transfer_err)
    }

    async fn download_file(&self, env: &Environment, path: &str) -> Result<Vec<u8>, EnvironmentError> {
        let target = self.resolve(env, path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| EnvironmentError::Transfer {
                instance: env.instance_id.clone(),
                path: path.to_string(),
                detail: e.to_string(),
            })
    }

    async fn stop(&self, instance_id: &str) -> Result<(), EnvironmentError> {
        let removed = self
            .instances
            .lock()
            .map_err(|_| EnvironmentError::Unavailable("instance table poisoned".into()))?
            .remove(instance_id);
        if let Some(dir) = removed {
            let path = dir.path().to_path_buf();
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|e| EnvironmentError::Unavailable(e.to_string()))?
                .map_err(|e| {
                    EnvironmentError::Unavailable(format!("cleanup of {} failed: {e}", path.display()))
                })?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{NetworkPolicy, ResourceLimits};
    use crate::ports::ExecStatus;

    fn request() -> EnvironmentRequest {
        EnvironmentRequest {
            label: "o_r_1".into(),
            image: ImageSpec::new("debian:bookworm"),
            limits: ResourceLimits::default(),
            network: NetworkPolicy::default(),
        }
    }

    #[tokio::test]
    async fn runs_commands_in_the_workdir() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        let env = backend.start("env-1", "host", &request()).await.unwrap();

        backend.upload_file(&env, "hello.txt", b"hi").await.unwrap();
        let result = backend
            .exec(&env, "cat hello.txt && exit 4", None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.status, ExecStatus::Exited(4));

        backend
            .exec(&env, "echo built > out.txt", None, Duration::from_secs(10))
            .await
            .unwrap();
        let bytes = backend.download_file(&env, "out.txt").await.unwrap();
        assert_eq!(bytes, b"built\n");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_removes_files() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        let env = backend.start("env-2", "host", &request()).await.unwrap();
        assert_eq!(backend.live_instances(), 1);

        backend.stop("env-2").await.unwrap();
        backend.stop("env-2").await.unwrap();
        backend.stop("never-started").await.unwrap();

        assert_eq!(backend.live_instances(), 0);
        assert!(!Path::new(&env.workdir).exists());
        let err = backend
            .exec(&env, "true", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::NotActive { .. }));
    }

    #[tokio::test]
    async fn transfers_cannot_escape_the_instance() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        let env = backend.start("env-3", "host", &request()).await.unwrap();

        let err = backend.upload_file(&env, "../../evil", b"x").await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Transfer { .. }));
        let err = backend.download_file(&env, "/etc/passwd").await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Transfer { .. }));
    }
}
