//! Task generation from change-request metadata.
//!
//! The project type picks the image and build command from a static profile
//! table. It is detected from the file names at the repository root unless
//! given explicitly.

use std::fmt;
use std::str::FromStr;

use crate::domain::{
    ChangeRequest, ChangeRequestRef, GenerateError, ImageSpec, NetworkPolicy, ResourceLimits, Task,
};
use crate::ports::{ChangeRequestSource, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectType {
    JavaGradle,
    JavaMaven,
    NodejsNpm,
    NodejsYarn,
    PythonPip,
    PythonPoetry,
    RustCargo,
    GoMod,
}

/// Image and build command for a project type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectProfile {
    pub base_image: &'static str,
    pub setup: &'static [&'static str],
    pub build_command: &'static str,
}

const APT_GIT: &[&str] = &["apt-get update && apt-get install -y git"];
const APT_GIT_CURL: &[&str] = &["apt-get update && apt-get install -y git curl"];
const APK_GIT: &[&str] = &["apk add --no-cache git bash"];

/// Image used when no project type applies and a build command was given.
const FALLBACK_IMAGE: &str = "debian:bookworm-slim";

impl ProjectType {
    /// Detection order: the first type with an indicator file wins.
    pub const ALL: [ProjectType; 8] = [
        ProjectType::JavaGradle,
        ProjectType::JavaMaven,
        ProjectType::NodejsNpm,
        ProjectType::NodejsYarn,
        ProjectType::PythonPip,
        ProjectType::PythonPoetry,
        ProjectType::RustCargo,
        ProjectType::GoMod,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ProjectType::JavaGradle => "java-gradle",
            ProjectType::JavaMaven => "java-maven",
            ProjectType::NodejsNpm => "nodejs-npm",
            ProjectType::NodejsYarn => "nodejs-yarn",
            ProjectType::PythonPip => "python-pip",
            ProjectType::PythonPoetry => "python-poetry",
            ProjectType::RustCargo => "rust-cargo",
            ProjectType::GoMod => "go-mod",
        }
    }

    fn indicators(self) -> &'static [&'static str] {
        match self {
            ProjectType::JavaGradle => &[
                "build.gradle",
                "build.gradle.kts",
                "gradlew",
                "settings.gradle",
                "settings.gradle.kts",
            ],
            ProjectType::JavaMaven => &["pom.xml"],
            ProjectType::NodejsNpm => &["package-lock.json"],
            ProjectType::NodejsYarn => &["yarn.lock"],
            ProjectType::PythonPip => &["requirements.txt", "setup.py"],
            ProjectType::PythonPoetry => &["poetry.lock"],
            ProjectType::RustCargo => &["Cargo.toml"],
            ProjectType::GoMod => &["go.mod"],
        }
    }

    pub fn profile(self) -> ProjectProfile {
        let (base_image, setup, build_command) = match self {
            ProjectType::JavaGradle => (
                "eclipse-temurin:17-jdk-jammy",
                APT_GIT_CURL,
                "./gradlew clean build -x test --no-daemon --stacktrace",
            ),
            ProjectType::JavaMaven => (
                "maven:3.9-eclipse-temurin-17",
                APT_GIT,
                "mvn clean compile -DskipTests -q",
            ),
            ProjectType::NodejsNpm => ("node:20-alpine", APK_GIT, "npm ci && npm run build"),
            ProjectType::NodejsYarn => (
                "node:20-alpine",
                APK_GIT,
                "yarn install --frozen-lockfile && yarn build",
            ),
            ProjectType::PythonPip => (
                "python:3.11-slim",
                APT_GIT,
                "pip install -r requirements.txt && python -m compileall .",
            ),
            ProjectType::PythonPoetry => (
                "python:3.11-slim",
                APT_GIT,
                "pip install poetry && poetry install && poetry build",
            ),
            ProjectType::RustCargo => ("rust:latest", APT_GIT, "cargo build --release"),
            ProjectType::GoMod => (
                "golang:1.21-alpine",
                APK_GIT,
                "go mod download && go build ./...",
            ),
        };
        ProjectProfile {
            base_image,
            setup,
            build_command,
        }
    }

    /// First project type whose indicator file is among `root_files`.
    pub fn detect<S: AsRef<str>>(root_files: &[S]) -> Option<ProjectType> {
        ProjectType::ALL.into_iter().find(|ty| {
            root_files
                .iter()
                .any(|f| ty.indicators().contains(&f.as_ref()))
        })
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ProjectType {
    type Err = GenerateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectType::ALL
            .into_iter()
            .find(|ty| ty.label() == s)
            .ok_or_else(|| GenerateError::UnknownProjectType(s.to_string()))
    }
}

/// Overrides applied while generating a task.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Skips detection.
    pub project_type: Option<ProjectType>,
    /// Replaces the profile's build command.
    pub build_command: Option<String>,
    /// Replaces the profile's base image.
    pub base_image: Option<String>,
    pub limits: ResourceLimits,
    pub network: NetworkPolicy,
}

/// Builds the task for `change` under `options`.
///
/// Fails with `NoBuildCommand` when no project type applies and no build
/// command was given.
pub fn task_from_change_request(
    change: &ChangeRequest,
    options: &GenerateOptions,
) -> Result<Task, GenerateError> {
    let key = change.reference.task_key();
    let project_type = options
        .project_type
        .or_else(|| ProjectType::detect(&change.root_files));
    let profile = project_type.map(ProjectType::profile);

    let build_command = match (&options.build_command, profile) {
        (Some(command), _) => command.clone(),
        (None, Some(profile)) => profile.build_command.to_string(),
        (None, None) => return Err(GenerateError::NoBuildCommand(key)),
    };
    let image = match (&options.base_image, profile) {
        (Some(base), Some(profile)) => ImageSpec {
            base_image: base.clone(),
            setup: profile.setup.iter().map(|s| s.to_string()).collect(),
        },
        (Some(base), None) => ImageSpec::new(base.clone()),
        (None, Some(profile)) => ImageSpec {
            base_image: profile.base_image.to_string(),
            setup: profile.setup.iter().map(|s| s.to_string()).collect(),
        },
        (None, None) => ImageSpec {
            base_image: FALLBACK_IMAGE.to_string(),
            setup: APT_GIT.iter().map(|s| s.to_string()).collect(),
        },
    };

    let source_repo_url = change
        .source_repo_url
        .clone()
        .filter(|url| url != &change.target_repo_url);

    Ok(Task {
        key,
        repo_url: change.target_repo_url.clone(),
        source_repo_url,
        target: change.target.clone(),
        source: change.source.clone(),
        build_command,
        image,
        limits: options.limits,
        network: options.network,
        project_type: project_type.map(|ty| ty.label().to_string()),
    })
}

/// Fetches metadata, builds the task and stores it.
pub struct TaskGenerator<'a> {
    source: &'a dyn ChangeRequestSource,
    tasks: &'a dyn TaskStore,
}

impl<'a> TaskGenerator<'a> {
    pub fn new(source: &'a dyn ChangeRequestSource, tasks: &'a dyn TaskStore) -> Self {
        Self { source, tasks }
    }

    /// Regenerating an existing key replaces the definition; recorded results
    /// are untouched.
    pub async fn generate(
        &self,
        reference: &ChangeRequestRef,
        options: &GenerateOptions,
    ) -> Result<Task, GenerateError> {
        let change = self.source.fetch(reference).await?;
        let task = task_from_change_request(&change, options)?;
        self.tasks.put(&task).await?;
        tracing::info!(
            task = %task.key,
            project_type = task.project_type.as_deref().unwrap_or("custom"),
            image = %task.image.base_image,
            "task generated"
        );
        Ok(task)
    }
}
