use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use worklane::error::{describe_error_code, ErrorCode, WorklaneError};
use worklane::orchestrator::{Orchestrator, TaskOutcome};
use worklane::subprocess::{ProcessRunner, TokioProcessRunner};
use worklane::task::load_tasks;
use worklane::workspace::{ReclaimOptions, WorkspaceManager};
use worklane::StackConfig;

/// Run agent tasks in parallel git worktrees behind a rate limiter
#[derive(Parser)]
#[command(name = "worklane", version)]
#[command(about = "Parallel agent task runner with isolated git worktrees", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file (worklane.yml or worklane.toml in the repository by default)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Repository root (default: current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every runnable task from a YAML or JSON task file
    Run {
        /// Task file
        tasks: PathBuf,

        /// Create workspaces but do not launch the executor
        #[arg(long)]
        dry_run: bool,

        /// Tasks to run at once (overrides pipeline.maxParallel)
        #[arg(short = 'j', long)]
        parallel: Option<usize>,

        /// Print outcomes as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage task workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// Check the executor, the repository and the worktree directory
    Health,
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// List workspaces registered with git
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show uncommitted changes and ahead/behind counts
    Status { task_id: String },
    /// Merge a task branch into the default (or given) branch
    Merge {
        task_id: String,
        /// Target branch (default: worktrees.defaultBranch)
        #[arg(long)]
        target: Option<String>,
        /// Keep the workspace after a successful merge
        #[arg(long)]
        keep: bool,
    },
    /// Remove a workspace and its branch
    Remove {
        task_id: String,
        /// Discard uncommitted changes, reclaiming when git refuses
        #[arg(short, long)]
        force: bool,
    },
    /// Commit leftover changes, delete the directory and prune the registry
    Reclaim {
        task_id: String,
        /// Commit message for leftover changes
        #[arg(short, long)]
        message: Option<String>,
        /// Keep the task branch
        #[arg(long)]
        keep_branch: bool,
    },
    /// Remove workspaces past the retention period
    Cleanup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("worklane started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        let code = match e.downcast_ref::<WorklaneError>() {
            Some(err) => {
                eprintln!("  ({})", describe_error_code(err.code()));
                err.exit_code()
            }
            None => 1,
        };
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let repo = match cli.repo {
        Some(repo) => repo,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let config = StackConfig::resolve(cli.config.as_deref(), &repo).map_err(WorklaneError::from)?;
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);

    match cli.command {
        Commands::Run {
            tasks,
            dry_run,
            parallel,
            json,
        } => {
            let mut config = config;
            config.pipeline.dry_run |= dry_run;
            if let Some(parallel) = parallel {
                config.pipeline.max_parallel = parallel.max(1);
            }
            run_tasks(&config, repo, runner, &tasks, json).await
        }
        Commands::Workspace { command } => {
            let manager = WorkspaceManager::new(
                runner,
                repo,
                config.worktrees.clone(),
                config.reclamation.clone(),
            );
            run_workspace_command(&manager, command).await
        }
        Commands::Health => {
            let orchestrator = Orchestrator::from_config(&config, repo, runner);
            let report = orchestrator.health_check().await;
            for (component, ok) in &report.components {
                println!("  {} {}", if *ok { "ok  " } else { "FAIL" }, component);
            }
            if report.healthy {
                println!("All components healthy");
                Ok(())
            } else {
                Err(WorklaneError::pipeline(ErrorCode::PIPELINE_GENERIC, "Health check failed", None).into())
            }
        }
    }
}

async fn run_tasks(
    config: &StackConfig,
    repo: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    tasks_file: &Path,
    json: bool,
) -> anyhow::Result<()> {
    let tasks: Vec<_> = load_tasks(tasks_file)?
        .into_iter()
        .filter(|task| task.is_runnable())
        .collect();
    if tasks.is_empty() {
        println!("No runnable tasks in {}", tasks_file.display());
        return Ok(());
    }

    let orchestrator = Orchestrator::from_config(config, repo, runner);
    let _sweeper = orchestrator.start_sweeper(config.pipeline.cleanup_interval);
    info!(
        "Running {} task(s) from {}",
        tasks.len(),
        tasks_file.display()
    );

    let batch = orchestrator.process_batch(&tasks);
    tokio::pin!(batch);
    let outcomes = tokio::select! {
        outcomes = &mut batch => outcomes,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping running tasks");
            let stopped = orchestrator.stop_all().await;
            debug!("Stop requested for {} task(s)", stopped);
            batch.await
        }
    };
    orchestrator.limiter().shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        print_outcomes(&outcomes);
    }

    let failed = outcomes.iter().filter(|o| !o.success).count();
    if failed > 0 {
        return Err(WorklaneError::pipeline(
            ErrorCode::PIPELINE_TASK_FAILED,
            format!("{failed} of {} task(s) failed", outcomes.len()),
            None,
        )
        .into());
    }
    Ok(())
}

fn print_outcomes(outcomes: &[TaskOutcome]) {
    for outcome in outcomes {
        let mark = if outcome.success { "✅" } else { "❌" };
        let detail = match &outcome.error {
            Some(error) => format!(" [E{:04}] {}", error.code, error.message),
            None => String::new(),
        };
        println!(
            "{} {} ({:?}, {:.1?}){}",
            mark, outcome.task_id, outcome.phase, outcome.duration, detail
        );
        if let Some(workspace) = outcome.workspace.as_ref().filter(|_| outcome.reclaim.is_none()) {
            println!("   workspace kept at {}", workspace.path.display());
        }
    }
}

async fn run_workspace_command(
    manager: &WorkspaceManager,
    command: WorkspaceCommands,
) -> anyhow::Result<()> {
    match command {
        WorkspaceCommands::List { json } => {
            let workspaces = manager.list().await.map_err(WorklaneError::from)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&workspaces)?);
            } else if workspaces.is_empty() {
                println!("No workspaces found.");
            } else {
                for workspace in workspaces {
                    println!(
                        "  {} - {} ({}, created {})",
                        workspace.task_id,
                        workspace.path.display(),
                        workspace.branch,
                        workspace.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        WorkspaceCommands::Status { task_id } => {
            let status = manager.status(&task_id).await.map_err(WorklaneError::from)?;
            println!(
                "{}: {}, {} ahead, {} behind",
                task_id,
                if status.has_changes {
                    "uncommitted changes"
                } else {
                    "clean"
                },
                status.ahead,
                status.behind
            );
        }
        WorkspaceCommands::Merge {
            task_id,
            target,
            keep,
        } => {
            let outcome = manager
                .merge(&task_id, target.as_deref(), !keep)
                .await
                .map_err(WorklaneError::from)?;
            println!("✅ Merged {} into {}", outcome.branch, outcome.target);
            if let Some(removed) = outcome.removed {
                println!("✅ Workspace removed");
                print_warnings(&removed.warnings);
            }
        }
        WorkspaceCommands::Remove { task_id, force } => {
            match manager.remove(&task_id, force).await.map_err(WorklaneError::from)? {
                Some(removed) => {
                    println!("✅ Removed workspace for {} ({})", task_id, removed.branch);
                    print_warnings(&removed.warnings);
                }
                None => println!("No workspace for {task_id}"),
            }
        }
        WorkspaceCommands::Reclaim {
            task_id,
            message,
            keep_branch,
        } => {
            let defaults = manager.default_reclaim_options();
            let options = ReclaimOptions {
                commit_message: message.unwrap_or(defaults.commit_message),
                delete_branch: !keep_branch,
            };
            let result = manager
                .reclaim(&task_id, &options)
                .await
                .map_err(WorklaneError::from)?;
            print_warnings(&result.warnings);
            if !result.success {
                return Err(WorklaneError::workspace_with_code(
                    ErrorCode::WORKSPACE_RECLAIM_FAILED,
                    format!("Reclaiming {task_id} failed"),
                    None,
                )
                .into());
            }
            println!(
                "✅ Reclaimed {}{}",
                task_id,
                if result.auto_committed {
                    " (leftover changes committed)"
                } else {
                    ""
                }
            );
        }
        WorkspaceCommands::Cleanup => {
            let removed = manager.cleanup().await.map_err(WorklaneError::from)?;
            println!("Removed {removed} expired workspace(s)");
        }
    }
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("⚠️  {warning}");
    }
}
