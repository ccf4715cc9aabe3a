//! Docker backend: one long-lived container per environment, driven through
//! the docker CLI.
//!
//! - image: `docker build -t <prefix>:<tag> -` with the rendered definition on stdin
//! - start: `docker run -d` running `sleep infinity` with cpu/memory/network limits
//! - exec: `docker exec -w <cwd> <id> sh -c <command>`
//! - files: `docker cp` through a local temp file
//! - stop: `docker rm -f` (an unknown container is not an error)

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::domain::{EnvironmentError, ImageSpec};
use crate::ports::{Environment, EnvironmentBackend, EnvironmentRequest, ExecResult, ExecStatus};

use super::process;

const CONTAINER_WORKDIR: &str = "/workspace";

/// Settings of the docker backend.
///
/// Defaults: `docker` from `PATH`, images tagged `mergecheck-env:<hash>`,
/// 30 minute image builds, 2 minute control commands.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub binary: String,
    pub image_prefix: String,
    pub build_timeout: Duration,
    pub control_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image_prefix: "mergecheck-env".to_string(),
            build_timeout: Duration::from_secs(30 * 60),
            control_timeout: Duration::from_secs(120),
        }
    }
}

pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        Command::new(&self.config.binary)
    }

    /// Runs a docker control command and returns its result.
    async fn control(
        &self,
        args: &[&str],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecResult, EnvironmentError> {
        let mut cmd = self.command();
        cmd.args(args);
        process::run(cmd, stdin, timeout).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EnvironmentError::Unavailable(format!("{} not found", self.config.binary))
            } else {
                EnvironmentError::Io(e)
            }
        })
    }

    fn image_ref(&self, tag: &str) -> String {
        format!("{}:{tag}", self.config.image_prefix)
    }

    /// Renders `docker run` arguments for an instance.
    fn run_args(instance_id: &str, image_ref: &str, request: &EnvironmentRequest) -> Vec<String> {
        vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            instance_id.into(),
            "--label".into(),
            format!("mergecheck.task={}", request.label),
            "--cpus".into(),
            request.limits.cpus.to_string(),
            "--memory".into(),
            format!("{}m", request.limits.memory_mb),
            "--network".into(),
            if request.network.allowed { "bridge" } else { "none" }.into(),
            "-w".into(),
            CONTAINER_WORKDIR.into(),
            image_ref.into(),
            "sleep".into(),
            "infinity".into(),
        ]
    }

    fn container_path(env: &Environment, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{path}", env.workdir.trim_end_matches('/'))
        }
    }
}

fn failure_detail(result: &ExecResult) -> String {
    match result.status {
        ExecStatus::TimedOut => "timed out".to_string(),
        ExecStatus::Exited(code) => format!("exit {code}: {}", result.stderr.trim()),
    }
}

#[async_trait]
impl EnvironmentBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn prepare_image(&self, image: &ImageSpec, tag: &str) -> Result<String, EnvironmentError> {
        let image_ref = self.image_ref(tag);

        let inspect = self
            .control(&["image", "inspect", image_ref.as_str()], None, self.config.control_timeout)
            .await?;
        if inspect.succeeded() {
            tracing::debug!(image = %image_ref, "image already present");
            return Ok(image_ref);
        }

        tracing::info!(image = %image_ref, base = %image.base_image, "building image");
        let build = self
            .control(
                &["build", "-t", image_ref.as_str(), "-"],
                Some(image.render().into_bytes()),
                self.config.build_timeout,
            )
            .await?;
        if !build.succeeded() {
            return Err(EnvironmentError::ImageBuild {
                image: image_ref,
                detail: failure_detail(&build),
            });
        }
        Ok(image_ref)
    }

    async fn start(
        &self,
        instance_id: &str,
        image_ref: &str,
        request: &EnvironmentRequest,
    ) -> Result<Environment, EnvironmentError> {
        let args = Self::run_args(instance_id, image_ref, request);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let run = self.control(&args, None, self.config.control_timeout).await?;
        if !run.succeeded() {
            return Err(EnvironmentError::Start {
                instance: instance_id.to_string(),
                detail: failure_detail(&run),
            });
        }
        Ok(Environment {
            instance_id: instance_id.to_string(),
            image_ref: image_ref.to_string(),
            workdir: CONTAINER_WORKDIR.to_string(),
        })
    }

    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, EnvironmentError> {
        let cwd = cwd.unwrap_or(env.workdir.as_str());
        let args = [
            "exec",
            "-e",
            "GIT_TERMINAL_PROMPT=0",
            "-w",
            cwd,
            env.instance_id.as_str(),
            "sh",
            "-c",
            command,
        ];
        let result = self.control(&args, None, timeout).await?;

        match result.status {
            ExecStatus::TimedOut => {
                // Killing the docker client leaves the process running in the container.
                let reap = self
                    .control(
                        &["exec", env.instance_id.as_str(), "sh", "-c", "kill -9 -1"],
                        None,
                        self.config.control_timeout,
                    )
                    .await;
                if let Err(err) = reap {
                    tracing::warn!(instance = %env.instance_id, error = %err, "failed to kill timed out command");
                }
            }
            // 125 from `docker exec` itself: daemon or container trouble, not the command
            ExecStatus::Exited(125) if result.stderr.contains("Error response from daemon") => {
                return Err(EnvironmentError::Exec {
                    instance: env.instance_id.clone(),
                    detail: result.stderr.trim().to_string(),
                });
            }
            ExecStatus::Exited(_) => {}
        }
        Ok(result)
    }

    async fn upload_file(
        &self,
        env: &Environment,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EnvironmentError> {
        let target = Self::container_path(env, path);
        let transfer_err = |detail: String| EnvironmentError::Transfer {
            instance: env.instance_id.clone(),
            path: target.clone(),
            detail,
        };

        if let Some(parent) = Path::new(&target).parent() {
            let mkdir = format!("mkdir -p '{}'", parent.display());
            let made = self.exec(env, &mkdir, Some("/"), self.config.control_timeout).await?;
            if !made.succeeded() {
                return Err(transfer_err(failure_detail(&made)));
            }
        }

        let local = tempfile::NamedTempFile::new().map_err(|e| transfer_err(e.to_string()))?;
        tokio::fs::write(local.path(), contents)
            .await
            .map_err(|e| transfer_err(e.to_string()))?;
        let source = local.path().to_string_lossy().into_owned();
        let dest = format!("{}:{target}", env.instance_id);
        let copy = self
            .control(&["cp", source.as_str(), dest.as_str()], None, self.config.control_timeout)
            .await?;
        if !copy.succeeded() {
            return Err(transfer_err(failure_detail(&copy)));
        }
        Ok(())
    }

    async fn download_file(&self, env: &Environment, path: &str) -> Result<Vec<u8>, EnvironmentError> {
        let source_path = Self::container_path(env, path);
        let transfer_err = |detail: String| EnvironmentError::Transfer {
            instance: env.instance_id.clone(),
            path: source_path.clone(),
            detail,
        };

        let local_dir = tempfile::tempdir().map_err(|e| transfer_err(e.to_string()))?;
        let local = local_dir.path().join("download");
        let source = format!("{}:{source_path}", env.instance_id);
        let dest = local.to_string_lossy().into_owned();
        let copy = self
            .control(&["cp", source.as_str(), dest.as_str()], None, self.config.control_timeout)
            .await?;
        if !copy.succeeded() {
            return Err(transfer_err(failure_detail(&copy)));
        }
        tokio::fs::read(&local)
            .await
            .map_err(|e| transfer_err(e.to_string()))
    }

    async fn stop(&self, instance_id: &str) -> Result<(), EnvironmentError> {
        let rm = self
            .control(&["rm", "-f", instance_id], None, self.config.control_timeout)
            .await?;
        if rm.succeeded() || rm.stderr.contains("No such container") {
            return Ok(());
        }
        Err(EnvironmentError::Unavailable(format!(
            "failed to remove {instance_id}: {}",
            failure_detail(&rm)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NetworkPolicy, ResourceLimits};

    fn request(network: bool) -> EnvironmentRequest {
        EnvironmentRequest {
            label: "octo_widgets_42".into(),
            image: ImageSpec::new("eclipse-temurin:17-jdk-jammy"),
            limits: ResourceLimits {
                cpus: 4,
                memory_mb: 2048,
                ..Default::default()
            },
            network: NetworkPolicy { allowed: network },
        }
    }

    #[test]
    fn run_args_apply_limits_and_network_policy() {
        let args = DockerBackend::run_args("mc-1", "mergecheck-env:abc", &request(false));
        let joined = args.join(" ");

        assert!(joined.contains("--name mc-1"));
        assert!(joined.contains("--cpus 4"));
        assert!(joined.contains("--memory 2048m"));
        assert!(joined.contains("--network none"));
        assert!(joined.ends_with("mergecheck-env:abc sleep infinity"));

        let open = DockerBackend::run_args("mc-1", "img", &request(true)).join(" ");
        assert!(open.contains("--network bridge"));
    }

    #[test]
    fn relative_paths_resolve_against_workdir() {
        let env = Environment {
            instance_id: "mc-1".into(),
            image_ref: "img".into(),
            workdir: "/workspace/".into(),
        };
        assert_eq!(DockerBackend::container_path(&env, "build.log"), "/workspace/build.log");
        assert_eq!(DockerBackend::container_path(&env, "/tmp/x"), "/tmp/x");
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let backend = DockerBackend::new(DockerConfig {
            binary: "/nonexistent/docker-binary".into(),
            ..Default::default()
        });
        let err = backend.stop("mc-1").await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Unavailable(_)));
    }
}
