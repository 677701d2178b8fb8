use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use hermes_core::{
    ConfigStore, Engine, EngineContext, EventBus, WorkspacePaths, DEFAULT_TEMPLATE,
};
use hermes_core::CircuitBreaker;
use hermes_observability::{init_process_logging, ProcessKind};
use hermes_plan::PlanStore;
use hermes_types::{HermesError, Priority, Status, TaskId};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hermes")]
#[command(about = "Autonomous plan executor for external coding assistants")]
struct Cli {
    /// Workspace root (defaults to $HERMES_HOME, then ./.hermes)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the workspace directories and a default configuration
    Init {
        /// Project directory to initialize (`.` or a new directory name)
        name: Option<String>,
    },
    /// Start or resume the execution engine
    Run {
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        workers: Option<usize>,
        /// Provider binding for coding invocations (name or `auto`)
        #[arg(long)]
        ai: Option<String>,
        #[arg(long)]
        auto_branch: bool,
        #[arg(long)]
        auto_commit: bool,
        /// Shorthand for fully unattended operation
        #[arg(long)]
        autonomous: bool,
        /// Begin at this task id, skipping earlier pending tasks
        #[arg(long)]
        start_from: Option<String>,
    },
    /// Show the derived progress table
    Status {
        /// Only tasks with this status
        #[arg(long)]
        filter: Option<String>,
        /// Only this feature
        #[arg(long)]
        feature: Option<String>,
        /// Only tasks with this priority
        #[arg(long)]
        priority: Option<String>,
    },
    /// Show one task in detail
    Task { id: String },
    /// Force the circuit breaker back to CLOSED
    Reset,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        match err.downcast_ref::<HermesError>() {
            Some(hermes) => {
                eprintln!("error[{}]: {hermes}", hermes.code());
                eprintln!("  remediation: {}", hermes.remediation());
            }
            None => eprintln!("error: {err:#}"),
        }
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Init { name } => init(cli.workspace, name).await,
        Command::Run {
            parallel,
            workers,
            ai,
            auto_branch,
            auto_commit,
            autonomous,
            start_from,
        } => {
            let start_from = start_from
                .map(|raw| TaskId::from_str(&raw))
                .transpose()?;
            run(
                cli.workspace,
                RunFlags {
                    parallel,
                    workers,
                    ai,
                    auto_branch,
                    auto_commit,
                    autonomous,
                    start_from,
                },
            )
            .await
        }
        Command::Status {
            filter,
            feature,
            priority,
        } => status(cli.workspace, filter, feature, priority).await,
        Command::Task { id } => task_detail(cli.workspace, id).await,
        Command::Reset => reset(cli.workspace).await,
    }
}

async fn init(workspace: Option<PathBuf>, name: Option<String>) -> anyhow::Result<()> {
    let target = match name.as_deref() {
        Some(".") | None => PathBuf::from("."),
        Some(name) => {
            tokio::fs::create_dir_all(name).await?;
            PathBuf::from(name)
        }
    };
    let paths = match workspace {
        Some(root) => WorkspacePaths::at(root),
        None => WorkspacePaths::at(target.join(".hermes")),
    };
    paths.init_workspace(DEFAULT_TEMPLATE).await?;
    ConfigStore::new(paths.config_file(), None).await?;
    println!("initialized hermes workspace at {}", paths.root().display());
    println!("  plan documents: {}", paths.tasks_dir().display());
    println!("  configuration:  {}", paths.config_file().display());
    Ok(())
}

struct RunFlags {
    parallel: bool,
    workers: Option<usize>,
    ai: Option<String>,
    auto_branch: bool,
    auto_commit: bool,
    autonomous: bool,
    start_from: Option<TaskId>,
}

fn cli_overrides(flags: &RunFlags) -> serde_json::Value {
    let mut overrides = serde_json::Map::new();
    if flags.parallel {
        overrides.insert("parallel".to_string(), json!(true));
    }
    if let Some(workers) = flags.workers {
        overrides.insert("max_workers".to_string(), json!(workers));
    }
    if let Some(ai) = &flags.ai {
        overrides.insert("coding_ai".to_string(), json!(ai));
    }
    if flags.auto_branch || flags.autonomous {
        overrides.insert("auto_branch".to_string(), json!(true));
    }
    if flags.auto_commit || flags.autonomous {
        overrides.insert("auto_commit".to_string(), json!(true));
    }
    serde_json::Value::Object(overrides)
}

async fn run(workspace: Option<PathBuf>, flags: RunFlags) -> anyhow::Result<()> {
    let paths = WorkspacePaths::resolve(workspace);
    paths.init_workspace(DEFAULT_TEMPLATE).await?;
    let config_store = ConfigStore::new(paths.config_file(), Some(cli_overrides(&flags))).await?;
    let config = config_store.get().await;

    let (_guard, log_info) = init_process_logging(
        ProcessKind::Engine,
        &paths.logs_dir(),
        config.log_retention_days,
    )?;
    info!(logs_dir = %log_info.logs_dir, "hermes starting");

    let repo_root = std::env::current_dir()?;
    let ctx = EngineContext::assemble(paths, config, repo_root).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, stopping after the current step...");
            signal_cancel.cancel();
        }
    });

    let engine = Engine::new(ctx.clone()).with_start_from(flags.start_from);
    let report = engine.run(&cancel).await?;

    println!(
        "run finished: {} completed, {} blocked{}",
        report.completed.len(),
        report.blocked.len(),
        if report.plan_complete {
            " (plan complete)"
        } else {
            ""
        }
    );
    for task in &report.blocked {
        println!("  blocked: {task} (see `hermes task {task}`)");
    }
    Ok(())
}

async fn load_plan(workspace: Option<PathBuf>) -> anyhow::Result<PlanStore> {
    let paths = WorkspacePaths::resolve(workspace);
    Ok(PlanStore::load(paths.tasks_dir()).await?)
}

async fn status(
    workspace: Option<PathBuf>,
    filter: Option<String>,
    feature: Option<String>,
    priority: Option<String>,
) -> anyhow::Result<()> {
    let plan = load_plan(workspace).await?;
    let status_filter = filter.map(|raw| Status::from_str(&raw)).transpose()?;
    let priority_filter = priority.map(|raw| Priority::from_str(&raw)).transpose()?;
    let feature_filter = feature
        .map(|raw| hermes_types::FeatureId::from_str(&raw))
        .transpose()?;

    let progress = plan.progress().await;
    println!(
        "plan: {}/{} tasks complete ({:.1}%)",
        progress.completed_tasks,
        progress.total_tasks,
        progress.percent_complete()
    );
    println!();

    for feature in plan.list_features().await {
        if feature_filter.is_some_and(|want| want != feature.id) {
            continue;
        }
        let done = feature
            .tasks
            .iter()
            .filter(|t| t.status == Status::Completed)
            .count();
        println!(
            "{} {}  [{}]  {}/{}",
            feature.id,
            feature.name,
            feature.status,
            done,
            feature.tasks.len()
        );
        for task in &feature.tasks {
            if status_filter.is_some_and(|want| want != task.status) {
                continue;
            }
            if priority_filter.is_some_and(|want| want != task.priority) {
                continue;
            }
            println!(
                "  {}  {:<12} {}  {}",
                task.id,
                task.status.as_str(),
                task.priority,
                task.name
            );
        }
    }
    Ok(())
}

async fn task_detail(workspace: Option<PathBuf>, id: String) -> anyhow::Result<()> {
    let plan = load_plan(workspace).await?;
    let task = plan.get_task(TaskId::from_str(&id)?).await?;

    println!("{} - {}", task.id, task.name);
    println!("  feature:  {}", task.feature_id);
    println!("  status:   {}", task.status);
    println!("  priority: {}", task.priority);
    if let Some(effort) = &task.estimated_effort {
        println!("  effort:   {effort}");
    }
    println!("  parallelizable: {}", task.parallelizable);
    if !task.dependencies.is_empty() {
        let deps: Vec<String> = task.dependencies.iter().map(|d| d.to_string()).collect();
        println!("  depends on: {}", deps.join(", "));
    }
    if !task.description.is_empty() {
        println!("\n{}", task.description);
    }
    if !task.files_to_touch.is_empty() {
        println!("\nfiles to touch:");
        for file in &task.files_to_touch {
            println!("  - {file}");
        }
    }
    if !task.success_criteria.is_empty() {
        println!("\nsuccess criteria:");
        for criterion in &task.success_criteria {
            let mark = if criterion.done { "x" } else { " " };
            println!("  [{mark}] {}", criterion.text);
        }
    }
    Ok(())
}

async fn reset(workspace: Option<PathBuf>) -> anyhow::Result<()> {
    let paths = WorkspacePaths::resolve(workspace);
    let breaker = CircuitBreaker::load(
        paths.circuit_state_file(),
        paths.circuit_history_file(),
        EventBus::new(),
    )
    .await?;
    let before = breaker.state().await;
    breaker.reset("manual reset via CLI").await?;
    println!(
        "circuit breaker reset: {} -> CLOSED",
        before.state.as_str()
    );
    if !before.reason.is_empty() {
        println!("  previous reason: {}", before.reason);
    }
    Ok(())
}
