use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use mergecheck_core::app::{
    GenerateOptions, OrchestratorBuilder, ProjectType, TaskGenerator, TaskSelector,
};
use mergecheck_core::config::{BackendKind, CONFIG_FILE, Settings};
use mergecheck_core::domain::{
    ChangeRequestRef, LockStatus, NetworkPolicy, ResultRecord, Task, TaskKey,
};
use mergecheck_core::impls::{DockerBackend, FsStore, JsonFileSource, LocalBackend};
use mergecheck_core::ports::{EnvironmentBackend, LockStore, ResultStore, TaskStore};

#[derive(Parser)]
#[command(name = "mergecheck", version, about = "Merge and build verification for change requests")]
struct Cli {
    /// Settings file (default: <data_dir>/mergecheck.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding tasks, results and locks
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate tasks from exported change-request metadata
    Generate(GenerateArgs),

    /// Verify tasks; exits 0 only if every task merged cleanly and built
    Run(RunArgs),

    /// List tasks with their latest status
    List,

    /// Show a task and every recorded result
    Show {
        key: String,
    },
}

#[derive(Args)]
struct GenerateArgs {
    /// JSON file with one change-request record or an array of them
    #[arg(long)]
    metadata: PathBuf,

    /// Change request URLs, e.g. https://github.com/owner/repo/pull/42
    #[arg(required = true)]
    references: Vec<String>,

    /// Skip detection (java-gradle, nodejs-npm, rust-cargo, ...)
    #[arg(long)]
    project_type: Option<ProjectType>,

    #[arg(long)]
    build_command: Option<String>,

    #[arg(long)]
    base_image: Option<String>,

    #[arg(long)]
    cpus: Option<u32>,

    #[arg(long)]
    memory_mb: Option<u64>,

    #[arg(long)]
    timeout_sec: Option<u64>,

    /// Run builds without network access
    #[arg(long)]
    no_network: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Task keys; combined with --filter
    keys: Vec<String>,

    /// Glob over task keys, e.g. 'octo_*'
    #[arg(long)]
    filter: Option<String>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Re-run tasks that already have a definitive result
    #[arg(long)]
    force: bool,

    #[arg(long)]
    backend: Option<BackendKind>,
}

#[derive(Serialize)]
struct TaskListing {
    key: TaskKey,
    project_type: Option<String>,
    lock: Option<LockStatus>,
    latest: Option<ResultRecord>,
}

#[derive(Serialize)]
struct TaskDetails {
    task: Task,
    lock: Option<LockStatus>,
    results: Vec<ResultRecord>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mergecheck_core=info,mergecheck=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.or_else(|| {
        cli.data_dir
            .as_ref()
            .map(|dir| dir.join(CONFIG_FILE))
            .filter(|path| path.is_file())
    });
    let mut settings = Settings::load(config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }

    match cli.cmd {
        Command::Generate(args) => generate(&settings, args).await,
        Command::Run(args) => run(settings, args).await,
        Command::List => list(&settings).await,
        Command::Show { key } => show(&settings, TaskKey::new(key)).await,
    }
}

fn open_store(settings: &Settings) -> Result<Arc<FsStore>> {
    let store = FsStore::open(&settings.data_dir)
        .with_context(|| format!("opening data directory {}", settings.data_dir.display()))?;
    Ok(Arc::new(store))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn generate(settings: &Settings, args: GenerateArgs) -> Result<ExitCode> {
    let store = open_store(settings)?;
    let source = JsonFileSource::new(&args.metadata);

    let mut limits = settings.limits;
    if let Some(cpus) = args.cpus {
        limits.cpus = cpus;
    }
    if let Some(memory_mb) = args.memory_mb {
        limits.memory_mb = memory_mb;
    }
    if let Some(timeout_sec) = args.timeout_sec {
        limits.timeout_sec = timeout_sec;
    }
    let options = GenerateOptions {
        project_type: args.project_type,
        build_command: args.build_command,
        base_image: args.base_image,
        limits,
        network: NetworkPolicy {
            allowed: !args.no_network,
        },
    };

    let generator = TaskGenerator::new(&source, store.as_ref());
    let mut tasks = Vec::with_capacity(args.references.len());
    for raw in &args.references {
        let reference: ChangeRequestRef = raw.parse()?;
        tasks.push(generator.generate(&reference, &options).await?);
    }
    print_json(&tasks)?;
    Ok(ExitCode::SUCCESS)
}

async fn run(mut settings: Settings, args: RunArgs) -> Result<ExitCode> {
    if let Some(concurrency) = args.concurrency {
        settings.run.concurrency = concurrency;
    }
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }
    settings.validate()?;

    let backend: Arc<dyn EnvironmentBackend> = match settings.backend {
        BackendKind::Docker => Arc::new(DockerBackend::new(settings.docker_config())),
        BackendKind::Local => Arc::new(LocalBackend::new(settings.data_dir.join("instances"))),
    };
    let orchestrator = OrchestratorBuilder::new()
        .stores(open_store(&settings)?)
        .backend(backend)
        .config(settings.run_config(args.force))
        .build()?;

    let mut selector = if args.keys.is_empty() && args.filter.is_none() {
        TaskSelector::all()
    } else {
        TaskSelector::keys(args.keys.into_iter().map(TaskKey::new))
    };
    if let Some(pattern) = &args.filter {
        selector = selector.with_filter(pattern)?;
    }

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight tasks");
            shutdown.request_shutdown();
        }
    });

    let report = orchestrator.run(&selector).await?;
    print_json(&report)?;

    Ok(if report.summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn list(settings: &Settings) -> Result<ExitCode> {
    let store = open_store(settings)?;
    let tasks = TaskStore::list(store.as_ref(), &|_: &Task| true).await?;

    let mut listing = Vec::with_capacity(tasks.len());
    for task in tasks {
        let lock = LockStore::load(store.as_ref(), &task.key).await?;
        let latest = store.latest(&task.key).await?;
        listing.push(TaskListing {
            project_type: task.project_type,
            lock: lock.map(|l| l.status),
            latest,
            key: task.key,
        });
    }
    print_json(&listing)?;
    Ok(ExitCode::SUCCESS)
}

async fn show(settings: &Settings, key: TaskKey) -> Result<ExitCode> {
    let store = open_store(settings)?;
    let task = store.get(&key).await?;
    let lock = LockStore::load(store.as_ref(), &key).await?;
    let results = ResultStore::list(store.as_ref(), &key).await?;
    print_json(&TaskDetails {
        task,
        lock: lock.map(|l| l.status),
        results,
    })?;
    Ok(ExitCode::SUCCESS)
}
