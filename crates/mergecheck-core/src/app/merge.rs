//! MergeSimulator: replays a merge inside an environment without committing it.
//!
//! Steps (all inside the environment's workdir):
//! 1. Init -> Cloned: shallow clone of the target branch
//! 2. Cloned -> TargetCheckedOut: deepen the target branch, make sure the
//!    pinned target commit is present, check it out on a scratch branch
//! 3. TargetCheckedOut -> MergeAttempted: fetch the source branch (possibly
//!    from a fork), make sure the pinned source commit is present and shares
//!    history with the target, merge it with `--no-commit --no-ff`
//! 4. MergeAttempted -> Clean | Conflicted: decided by unmerged paths
//!
//! Missing refs, missing repositories and authentication failures end in
//! `FetchFailed`. Transport faults, timeouts and other infrastructure faults
//! abort with a `MergeError` so the caller can retry.

use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{MergeError, MergeOutcome, MergeState, Task};
use crate::ports::{Environment, ExecResult};

use super::environment::EnvironmentManager;

/// How much history is fetched for the target and source branches.
const FETCH_DEPTH: u32 = 50;

/// Local branch the target commit is checked out on.
const MERGE_BRANCH: &str = "mergecheck/merge";

/// Committer identity passed to git for the merge.
#[derive(Debug, Clone)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "mergecheck".to_string(),
            email: "mergecheck@verifier.local".to_string(),
        }
    }
}

/// What a completed simulation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    /// States visited, starting with `Init`.
    pub trail: Vec<MergeState>,
    /// Unmerged paths when `Conflicted`.
    pub conflicts: Vec<String>,
    /// Why the fetch failed, when `FetchFailed`.
    pub detail: Option<String>,
    /// Transcript of the git commands and their output.
    pub log: String,
}

#[derive(Debug, Clone, Default)]
pub struct MergeSimulator {
    identity: GitIdentity,
}

impl MergeSimulator {
    pub fn new(identity: GitIdentity) -> Self {
        Self { identity }
    }

    /// Drives `env` through the merge of `task` within `budget`.
    ///
    /// Deterministic for fixed commits: the same task always ends in the same
    /// outcome.
    pub async fn simulate(
        &self,
        envs: &EnvironmentManager,
        env: &Environment,
        task: &Task,
        budget: Duration,
    ) -> Result<MergeReport, MergeError> {
        let mut session = Session {
            envs,
            env,
            deadline: Instant::now() + budget,
            state: MergeState::Init,
            trail: vec![MergeState::Init],
            log: String::new(),
        };
        let result = self.run(&mut session, task).await;
        match &result {
            Ok(report) => tracing::debug!(
                task = %task.key,
                outcome = ?report.outcome,
                conflicts = report.conflicts.len(),
                "merge simulated"
            ),
            Err(err) => tracing::warn!(
                task = %task.key,
                state = session.state.label(),
                error = %err,
                "merge simulation aborted"
            ),
        }
        result
    }

    async fn run(&self, s: &mut Session<'_>, task: &Task) -> Result<MergeReport, MergeError> {
        // Init -> Cloned
        let clone = s
            .git(
                "clone",
                format!(
                    "git clone --quiet --depth=1 --branch {} -- {} .",
                    quote(&task.target.branch),
                    quote(&task.repo_url)
                ),
            )
            .await?;
        if !clone.succeeded() {
            return s.fetch_failed_or_abort("clone", &clone);
        }
        s.transition(MergeState::Cloned);

        // Cloned -> TargetCheckedOut
        let deepen = s
            .git(
                "fetch_target",
                format!(
                    "git fetch --quiet --depth={FETCH_DEPTH} origin {}",
                    quote(&task.target.branch)
                ),
            )
            .await?;
        if !deepen.succeeded() {
            return s.fetch_failed_or_abort("fetch_target", &deepen);
        }
        if let Some(failed) = s
            .ensure_commit("fetch_target", "origin", &task.target.commit)
            .await?
        {
            return s.fetch_failed_or_abort("fetch_target", &failed);
        }
        let checkout = s
            .git(
                "checkout",
                format!(
                    "git checkout --quiet -B {MERGE_BRANCH} {}",
                    quote(&task.target.commit)
                ),
            )
            .await?;
        if !checkout.succeeded() {
            return Err(MergeError::Infra {
                step: "checkout",
                detail: first_line(&checkout.stderr),
            });
        }
        s.transition(MergeState::TargetCheckedOut);

        // TargetCheckedOut -> MergeAttempted
        let source_url = quote(task.source_url());
        let fetch_source = s
            .git(
                "fetch_source",
                format!(
                    "git fetch --quiet --depth={FETCH_DEPTH} {source_url} {}",
                    quote(&task.source.branch)
                ),
            )
            .await?;
        if !fetch_source.succeeded() {
            return s.fetch_failed_or_abort("fetch_source", &fetch_source);
        }
        if let Some(failed) = s
            .ensure_commit("fetch_source", task.source_url(), &task.source.commit)
            .await?
        {
            return s.fetch_failed_or_abort("fetch_source", &failed);
        }
        let base = s
            .git(
                "merge_base",
                format!(
                    "git merge-base {} {}",
                    quote(&task.target.commit),
                    quote(&task.source.commit)
                ),
            )
            .await?;
        match base.exit_code() {
            Some(0) => {}
            Some(1) => {
                return Ok(s.finish(
                    MergeOutcome::FetchFailed,
                    Vec::new(),
                    Some(format!(
                        "no common history within {FETCH_DEPTH} commits of target and source"
                    )),
                ));
            }
            _ => {
                return Err(MergeError::Infra {
                    step: "merge_base",
                    detail: first_line(&base.stderr),
                });
            }
        }
        let merge = s
            .git(
                "merge",
                format!(
                    "git -c user.name={} -c user.email={} merge --no-commit --no-ff {}",
                    quote(&self.identity.name),
                    quote(&self.identity.email),
                    quote(&task.source.commit)
                ),
            )
            .await?;
        s.transition(MergeState::MergeAttempted);

        // MergeAttempted -> Clean | Conflicted
        let unmerged = s
            .git("conflicts", "git diff --name-only --diff-filter=U".to_string())
            .await?;
        if !unmerged.succeeded() {
            return Err(MergeError::Infra {
                step: "conflicts",
                detail: first_line(&unmerged.stderr),
            });
        }
        let conflicts: Vec<String> = unmerged
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if !conflicts.is_empty() {
            return Ok(s.finish(MergeOutcome::Conflicted, conflicts, None));
        }
        if !merge.succeeded() {
            return Err(MergeError::Infra {
                step: "merge",
                detail: first_line(&merge.combined_output()),
            });
        }
        Ok(s.finish(MergeOutcome::Clean, Vec::new(), None))
    }
}

struct Session<'a> {
    envs: &'a EnvironmentManager,
    env: &'a Environment,
    deadline: Instant,
    state: MergeState,
    trail: Vec<MergeState>,
    log: String,
}

impl Session<'_> {
    async fn git(&mut self, step: &'static str, command: String) -> Result<ExecResult, MergeError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MergeError::Timeout { step });
        }
        let result = self.envs.exec(self.env, &command, None, remaining).await?;

        self.log.push_str("$ ");
        self.log.push_str(&command);
        self.log.push('\n');
        let output = result.combined_output();
        if !output.is_empty() {
            self.log.push_str(&output);
            if !output.ends_with('\n') {
                self.log.push('\n');
            }
        }

        if result.timed_out() {
            return Err(MergeError::Timeout { step });
        }
        Ok(result)
    }

    /// Fetches `commit` from `remote` unless it is already present.
    /// Returns the failed fetch when it could not be obtained.
    async fn ensure_commit(
        &mut self,
        step: &'static str,
        remote: &str,
        commit: &str,
    ) -> Result<Option<ExecResult>, MergeError> {
        let present = self
            .git(step, format!("git cat-file -e {}", quote(&format!("{commit}^{{commit}}"))))
            .await?;
        if present.succeeded() {
            return Ok(None);
        }
        let fetched = self
            .git(
                step,
                format!(
                    "git fetch --quiet --depth={FETCH_DEPTH} {} {}",
                    quote(remote),
                    quote(commit)
                ),
            )
            .await?;
        Ok((!fetched.succeeded()).then_some(fetched))
    }

    fn transition(&mut self, next: MergeState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal merge transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(from = self.state.label(), to = next.label(), "merge state");
        self.state = next;
        self.trail.push(next);
    }

    fn finish(
        &mut self,
        outcome: MergeOutcome,
        conflicts: Vec<String>,
        detail: Option<String>,
    ) -> MergeReport {
        self.transition(MergeState::Finished(outcome));
        MergeReport {
            outcome,
            trail: std::mem::take(&mut self.trail),
            conflicts,
            detail,
            log: std::mem::take(&mut self.log),
        }
    }

    /// Maps a failed clone/fetch to `FetchFailed` or a retryable error.
    fn fetch_failed_or_abort(
        &mut self,
        step: &'static str,
        failed: &ExecResult,
    ) -> Result<MergeReport, MergeError> {
        let output = failed.combined_output();
        match classify_fetch_failure(&output) {
            FetchFailure::Unavailable => Ok(self.finish(
                MergeOutcome::FetchFailed,
                Vec::new(),
                Some(format!("{step}: {}", first_line(&output))),
            )),
            FetchFailure::Network => Err(MergeError::Network {
                step,
                detail: first_line(&output),
            }),
            FetchFailure::Infra => Err(MergeError::Infra {
                step,
                detail: first_line(&output),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchFailure {
    /// The ref, commit or repository is missing or not accessible.
    Unavailable,
    /// Transport fault; a retry may succeed.
    Network,
    /// The environment itself is unhealthy.
    Infra,
}

const NETWORK_MARKERS: &[&str] = &[
    "could not resolve host",
    "connection timed out",
    "connection refused",
    "connection reset",
    "operation timed out",
    "temporary failure in name resolution",
    "early eof",
    "rpc failed",
    "the remote end hung up unexpectedly",
    "gnutls",
    "ssl_",
    "tls connection",
];

const INFRA_MARKERS: &[&str] = &[
    "no space left on device",
    "out of memory",
    "cannot allocate memory",
    "read-only file system",
];

fn classify_fetch_failure(output: &str) -> FetchFailure {
    let lower = output.to_lowercase();
    let auth_or_missing = [
        "authentication failed",
        "could not read username",
        "repository not found",
        "not found in upstream",
        "couldn't find remote ref",
        "returned error: 403",
        "returned error: 404",
    ];
    if auth_or_missing.iter().any(|m| lower.contains(m)) {
        return FetchFailure::Unavailable;
    }
    if INFRA_MARKERS.iter().any(|m| lower.contains(m)) {
        return FetchFailure::Infra;
    }
    if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        return FetchFailure::Network;
    }
    FetchFailure::Unavailable
}

/// Single-quotes `raw` for `sh -c`.
fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

fn first_line(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}
