//! Scripted backend: an in-process environment runtime for tests and dry runs.
//!
//! Commands are answered by the first rule whose pattern is a substring of the
//! command line; unmatched commands exit 0 with no output. Faults can be
//! injected into image preparation and instance start.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{EnvironmentError, ImageSpec};
use crate::ports::{Environment, EnvironmentBackend, EnvironmentRequest, ExecResult, ExecStatus};

/// Canned answer to a command.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Simulated run time; a delay beyond the exec timeout yields `TimedOut`.
    pub delay: Duration,
}

impl Reply {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, out: impl Into<String>) -> Self {
        self.stdout = out.into();
        self
    }

    pub fn stderr(mut self, err: impl Into<String>) -> Self {
        self.stderr = err.into();
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// How `start` misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFault {
    /// Fail before anything exists.
    Refuse,
    /// Create the instance, then fail (a partially successful acquire).
    FailAfterCreate,
}

#[derive(Default)]
struct ScriptState {
    live: HashSet<String>,
    max_live: usize,
    started: usize,
    image_builds: usize,
    prepare_failures: u32,
    start_faults: Vec<StartFault>,
    files: HashMap<(String, String), Vec<u8>>,
    history: Vec<(String, String)>,
}

pub struct ScriptedBackend {
    rules: Vec<(String, Reply)>,
    image_build_delay: Duration,
    state: Mutex<ScriptState>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            image_build_delay: Duration::ZERO,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Answers commands containing `pattern` with `reply`. Earlier rules win.
    pub fn on(mut self, pattern: impl Into<String>, reply: Reply) -> Self {
        self.rules.push((pattern.into(), reply));
        self
    }

    pub fn with_image_build_delay(mut self, delay: Duration) -> Self {
        self.image_build_delay = delay;
        self
    }

    /// The next `count` image preparations fail.
    pub fn fail_image_builds(self, count: u32) -> Self {
        self.lock().prepare_failures = count;
        self
    }

    /// The next starts fail, in order, with the given faults.
    pub fn fail_starts(self, faults: impl IntoIterator<Item = StartFault>) -> Self {
        self.lock().start_faults.extend(faults);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn live_instances(&self) -> usize {
        self.lock().live.len()
    }

    /// Highest number of simultaneously live instances observed.
    pub fn max_live_instances(&self) -> usize {
        self.lock().max_live
    }

    pub fn started_instances(&self) -> usize {
        self.lock().started
    }

    pub fn image_builds(&self) -> usize {
        self.lock().image_builds
    }

    /// Every executed command as `(instance_id, command)`.
    pub fn history(&self) -> Vec<(String, String)> {
        self.lock().history.clone()
    }

    fn reply_for(&self, command: &str) -> Reply {
        self.rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_default()
    }

    fn ensure_live(&self, instance_id: &str) -> Result<(), EnvironmentError> {
        if self.lock().live.contains(instance_id) {
            Ok(())
        } else {
            Err(EnvironmentError::NotActive {
                instance: instance_id.to_string(),
            })
        }
    }
}

#[async_trait]
impl EnvironmentBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn prepare_image(&self, image: &ImageSpec, tag: &str) -> Result<String, EnvironmentError> {
        if !self.image_build_delay.is_zero() {
            tokio::time::sleep(self.image_build_delay).await;
        }
        let mut state = self.lock();
        if state.prepare_failures > 0 {
            state.prepare_failures -= 1;
            return Err(EnvironmentError::ImageBuild {
                image: image.base_image.clone(),
                detail: "injected build failure".into(),
            });
        }
        state.image_builds += 1;
        Ok(format!("scripted:{tag}"))
    }

    async fn start(
        &self,
        instance_id: &str,
        image_ref: &str,
        _request: &EnvironmentRequest,
    ) -> Result<Environment, EnvironmentError> {
        let mut state = self.lock();
        let fault = if state.start_faults.is_empty() {
            None
        } else {
            Some(state.start_faults.remove(0))
        };
        let injected = |detail: &str| EnvironmentError::Start {
            instance: instance_id.to_string(),
            detail: detail.to_string(),
        };
        match fault {
            Some(StartFault::Refuse) => return Err(injected("injected start refusal")),
            Some(StartFault::FailAfterCreate) => {
                state.live.insert(instance_id.to_string());
                state.max_live = state.max_live.max(state.live.len());
                return Err(injected("injected failure after create"));
            }
            None => {}
        }

        state.live.insert(instance_id.to_string());
        state.started += 1;
        state.max_live = state.max_live.max(state.live.len());
        Ok(Environment {
            instance_id: instance_id.to_string(),
            image_ref: image_ref.to_string(),
            workdir: "/workspace".to_string(),
        })
    }

    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        _cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, EnvironmentError> {
        self.ensure_live(&env.instance_id)?;
        self.lock()
            .history
            .push((env.instance_id.clone(), command.to_string()));

        let reply = self.reply_for(command);
        if reply.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(ExecResult {
                status: ExecStatus::TimedOut,
                stdout: reply.stdout,
                stderr: String::new(),
                duration: timeout,
            });
        }
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        Ok(ExecResult {
            status: ExecStatus::Exited(reply.exit_code),
            stdout: reply.stdout,
            stderr: reply.stderr,
            duration: reply.delay,
        })
    }

    async fn upload_file(
        &self,
        env: &Environment,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EnvironmentError> {
        self.ensure_live(&env.instance_id)?;
        self.lock()
            .files
            .insert((env.instance_id.clone(), path.to_string()), contents.to_vec());
        Ok(())
    }

    async fn download_file(&self, env: &Environment, path: &str) -> Result<Vec<u8>, EnvironmentError> {
        self.ensure_live(&env.instance_id)?;
        self.lock()
            .files
            .get(&(env.instance_id.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| EnvironmentError::Transfer {
                instance: env.instance_id.clone(),
                path: path.to_string(),
                detail: "no such file".into(),
            })
    }

    async fn stop(&self, instance_id: &str) -> Result<(), EnvironmentError> {
        let mut state = self.lock();
        state.live.remove(instance_id);
        state.files.retain(|(instance, _), _| instance != instance_id);
        Ok(())
    }
}
