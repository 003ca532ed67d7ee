mod importer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use showsync_config::ShowSyncConfig;
use showsync_locks::{LockManager, generate_holder_id};
use showsync_resolver::relink_batch;
use showsync_scheduler::{ExecutionRunner, RunNowOutcome, StatusStore, TaskScheduler};
use showsync_storage::{KvStore, ShowSyncStorage};

use importer::HttpImporter;

#[derive(Parser)]
#[command(name = "showsync", about = "Scheduled metadata imports for tracked shows")]
struct Cli {
    /// Config file path (defaults to ~/.showsync/config.json5)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Serve,
    /// List tasks with their current status
    Tasks,
    /// Run one task immediately
    Run {
        /// Task ID
        task_id: String,
    },
    /// Find tasks whose target item is gone and suggest replacements
    CleanInvalid,
    /// Re-point failed tasks with the given dangling target at another item
    Relink {
        /// The target ID that no longer resolves
        dangling_id: String,
        /// The replacement media item ID
        item_id: String,
    },
    /// Check system health
    Health,
}

struct App {
    storage: Arc<ShowSyncStorage>,
    locks: Arc<LockManager>,
    status: Arc<StatusStore>,
    scheduler: Arc<TaskScheduler>,
    config: ShowSyncConfig,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ShowSyncConfig> {
    let config = match path {
        Some(path) => showsync_config::load_config_from(path)?,
        None => showsync_config::load_config()?,
    };
    config.validate()?;
    Ok(config)
}

fn build_app(config: ShowSyncConfig) -> anyhow::Result<App> {
    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage = Arc::new(ShowSyncStorage::open(&db_path)?);

    let holder_id = config
        .holder_id
        .clone()
        .unwrap_or_else(generate_holder_id);
    let locks = Arc::new(LockManager::new(
        storage.clone() as Arc<dyn KvStore>,
        holder_id,
    ));

    let status = Arc::new(StatusStore::new(storage.clone()));
    let runner = Arc::new(ExecutionRunner::new(
        storage.clone(),
        Arc::new(HttpImporter::new(&config.import)),
        Duration::from_secs(config.scheduler.execution_timeout_secs),
    ));
    let scheduler = TaskScheduler::new(
        storage.clone(),
        locks.clone(),
        status.clone(),
        runner,
        Duration::from_secs(config.scheduler.lock_timeout_secs),
    )?;

    Ok(App {
        storage,
        locks,
        status,
        scheduler,
        config,
    })
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_serve(config))?;
        }
        Commands::Tasks => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let app = build_app(config)?;
                for snap in app.status.snapshots().await? {
                    let state = if snap.is_running {
                        "running"
                    } else if snap.enabled {
                        "enabled"
                    } else {
                        "disabled"
                    };
                    let last = match snap.last_run_status {
                        Some(status) => format!("{status:?}"),
                        None => "never ran".to_string(),
                    };
                    println!("{}  [{state}]  last: {last}", snap.task_id);
                    if let Some(next) = snap.next_run {
                        println!("  next run: {next}");
                    }
                    if let Some(error) = snap.last_run_error {
                        println!("  error: {error}");
                    }
                }
                anyhow::Ok(())
            })?;
        }
        Commands::Run { task_id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let app = build_app(config)?;
                match app.scheduler.run_now(&task_id).await? {
                    RunNowOutcome::Completed(outcome) => {
                        println!("run finished: {:?}", outcome.status);
                        if let Some(error) = outcome.error {
                            println!("  error: {error}");
                        }
                    }
                    RunNowOutcome::AlreadyRunning { reason } => {
                        println!("task is already running: {reason}");
                    }
                }
                anyhow::Ok(())
            })?;
        }
        Commands::CleanInvalid => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let app = build_app(config)?;
                let invalid = app.scheduler.clean_invalid_tasks().await?;
                if invalid.is_empty() {
                    println!("all task targets resolve");
                    return anyhow::Ok(());
                }
                for entry in invalid {
                    println!(
                        "{} -> missing target {}",
                        entry.task.id, entry.task.target_id
                    );
                    if entry.candidates.is_empty() {
                        println!("  no replacement candidates");
                    }
                    for candidate in entry.candidates {
                        println!(
                            "  {} (score {}): {}",
                            candidate.item.id,
                            candidate.score,
                            candidate.all_reasons.join(", ")
                        );
                    }
                }
                anyhow::Ok(())
            })?;
        }
        Commands::Relink {
            dangling_id,
            item_id,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let app = build_app(config)?;
                let Some(item) = app.storage.get_item(&item_id).await? else {
                    anyhow::bail!("media item not found: {item_id}");
                };
                let results = relink_batch(&app.storage, &dangling_id, &item).await?;
                if results.is_empty() {
                    println!("no failed tasks reference {dangling_id}");
                }
                for result in results {
                    match result.error {
                        None => println!("{}: re-linked to {}", result.task_id, item.id),
                        Some(error) => println!("{}: failed ({error})", result.task_id),
                    }
                }
                anyhow::Ok(())
            })?;
        }
        Commands::Health => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                println!("showsync is healthy");
                println!("  import endpoint: {}", config.import.endpoint);
                println!(
                    "  lock timeout: {}s, execution timeout: {}s",
                    config.scheduler.lock_timeout_secs, config.scheduler.execution_timeout_secs
                );
                let app = build_app(config)?;
                let counts = app.status.counts().await?;
                println!(
                    "  tasks: {} enabled, {} disabled, {} running, {} failed",
                    counts.enabled, counts.disabled, counts.running, counts.failed
                );
                anyhow::Ok(())
            })?;
        }
    }

    Ok(())
}

async fn run_serve(config: ShowSyncConfig) -> anyhow::Result<()> {
    let app = build_app(config)?;

    // Log status transitions as they happen
    app.status
        .subscribe(Arc::new(|event| {
            Box::pin(async move {
                tracing::info!(task_id = %event.task_id, change = ?event.change, "Task status changed");
            })
        }))
        .await;

    let armed = app.scheduler.reconcile().await?;
    tracing::info!(armed, "Scheduler running, press ctrl-c to stop");

    // Optional periodic sweep to bound stale-lock buildup
    if let Some(secs) = app.config.scheduler.lock_sweep_interval_secs {
        let locks = app.locks.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.tick().await; // the startup sweep already ran
            loop {
                interval.tick().await;
                if let Err(e) = locks.sweep_expired().await {
                    tracing::warn!(error = %e, "Periodic lock sweep failed");
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    app.scheduler.shutdown().await;
    Ok(())
}
