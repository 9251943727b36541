use std::fs::OpenOptions;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use batchline::cli::{CancelArgs, Cli, Commands, MonitorArgs, PipelineArgs};
use batchline::config::{self, AppConfig};
use batchline::error::AppError;
use batchline::paths::AppPaths;
use batchline::services::client::{BatchClient, HttpBatchClient};
use batchline::services::status::StatusSummary;
use batchline::services::{splitter, supervisor};
use batchline::store::{ChunkStatus, Store, TaskStatus};

/// Refresh interval for `monitor` and pipeline tailing.
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration from {}: {err}", cli.config.display());
            process::exit(1);
        }
    };
    let paths = match resolve_paths(&config) {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    let daemon_internal = matches!(cli.command, Some(Commands::DaemonInternal));
    init_tracing(determine_log_level(&cli), &paths, daemon_internal);

    if let Err(err) = run(cli, config, paths).await {
        tracing::error!(error = %err, "command failed");
        eprintln!("{err}");
        process::exit(1);
    }
}

async fn run(cli: Cli, config: AppConfig, paths: AppPaths) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Pipeline(args)) => run_pipeline(args, &cli.config, config, paths).await,
        Some(Commands::Cancel(args)) => run_cancel(args, config, paths).await,
        Some(Commands::Monitor(args)) => run_monitor(args, paths).await,
        Some(Commands::Daemon) => {
            match supervisor::ensure_daemon(&paths, &cli.config)? {
                supervisor::DaemonLaunch::AlreadyRunning(pid) => {
                    println!("daemon already running (pid {pid})");
                }
                supervisor::DaemonLaunch::Spawned(pid) => {
                    println!("daemon started (pid {pid})");
                }
            }
            Ok(())
        }
        Some(Commands::DaemonInternal) => {
            let store = Arc::new(Store::open(&paths)?);
            let client: Arc<dyn BatchClient> = Arc::new(HttpBatchClient::new(
                &config.model.base_url,
                &config.model.password,
            )?);
            supervisor::run_daemon_internal(store, paths, Arc::new(config), client).await?;
            Ok(())
        }
        None => {
            Cli::print_help();
            Ok(())
        }
    }
}

async fn run_pipeline(
    args: PipelineArgs,
    config_path: &Path,
    config: AppConfig,
    paths: AppPaths,
) -> Result<(), AppError> {
    let store = Arc::new(Store::open(&paths)?);
    let task_id = args
        .task_id
        .clone()
        .unwrap_or_else(splitter::generate_task_id);

    if store.task_exists(&task_id)? {
        println!("task {task_id} already exists; resuming");
    } else {
        let report = splitter::split_file(
            &store,
            &paths,
            &config,
            &args.input,
            &task_id,
            args.lines_per_chunk,
        )?;
        println!(
            "split completed: {} valid lines into {} chunks ({} format errors)",
            report.total_lines, report.total_chunks, report.error_count
        );
        if let Some(log) = &report.format_errors_path {
            println!("format errors recorded at {}", log.display());
        }
    }

    supervisor::ensure_daemon(&paths, config_path)?;

    let status = watch_task(&store, &task_id).await?;
    if status != TaskStatus::ProcessCompleted {
        return Err(AppError::TaskEnded { task_id, status });
    }
    let output = paths.merged_dir(&task_id)?.join("output.jsonl");
    println!("task {task_id} completed; output at {}", output.display());
    Ok(())
}

async fn run_cancel(args: CancelArgs, config: AppConfig, paths: AppPaths) -> Result<(), AppError> {
    let store = Store::open(&paths)?;
    let view = store
        .get_task_view(&args.task_id)?
        .ok_or_else(|| AppError::TaskNotFound {
            task_id: args.task_id.clone(),
        })?;
    if view.task.status.is_terminal() {
        println!(
            "task {} already terminal ({})",
            args.task_id,
            view.task.status.as_str()
        );
        return Ok(());
    }

    store.update_task_status(&args.task_id, TaskStatus::Stopping, None)?;
    println!("cancellation requested for task {}", args.task_id);

    // Best-effort remote cancellation; task state never waits on it.
    let client = HttpBatchClient::new(&config.model.base_url, &config.model.password)?;
    for chunk in &view.chunks {
        if chunk.status != ChunkStatus::Processing {
            continue;
        }
        let Some(batch_id) = chunk.batch_id.as_deref() else {
            continue;
        };
        if let Err(err) = client.cancel_batch(batch_id).await {
            tracing::warn!(
                chunk_id = %chunk.chunk_id,
                batch_id = %batch_id,
                error = %err,
                "remote cancel failed"
            );
        }
    }
    Ok(())
}

async fn run_monitor(args: MonitorArgs, paths: AppPaths) -> Result<(), AppError> {
    let store = Arc::new(Store::open(&paths)?);
    match args.task_id {
        Some(task_id) => {
            let status = watch_task(&store, &task_id).await?;
            println!("task {task_id} finished as {}", status.as_str());
            Ok(())
        }
        None => monitor_all(&store).await,
    }
}

/// Follow one task with a progress bar until it reaches a terminal state.
async fn watch_task(store: &Store, task_id: &str) -> Result<TaskStatus, AppError> {
    let pb = make_progress_bar();
    loop {
        let Some(view) = store.get_task_view(task_id)? else {
            pb.abandon();
            return Err(AppError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        };
        let summary = StatusSummary::of(&view);
        let total = (view.chunks.len() as u64).max(1);
        pb.set_length(total);
        pb.set_position(summary.done_chunks() as u64);
        pb.set_message(format!(
            "{} retry {}/{} records {}+{}",
            summary.status.as_str(),
            summary.retry,
            summary.max_retry,
            summary.completed_records,
            summary.failed_records,
        ));

        if view.task.status.is_terminal() {
            pb.finish_with_message(view.task.status.as_str().to_string());
            println!("{}", summary.render());
            return Ok(view.task.status);
        }
        tokio::time::sleep(WATCH_INTERVAL).await;
    }
}

/// Print a summary block for every active task until none remain.
async fn monitor_all(store: &Store) -> Result<(), AppError> {
    loop {
        let tasks = store.list_active_tasks()?;
        if tasks.is_empty() {
            println!("no active tasks");
            return Ok(());
        }
        println!("=== {} active task(s) ===", tasks.len());
        for task in &tasks {
            if let Some(view) = store.get_task_view(&task.task_id)? {
                println!("{}", StatusSummary::of(&view).render());
            }
        }
        tokio::time::sleep(WATCH_INTERVAL).await;
    }
}

fn resolve_paths(config: &AppConfig) -> Result<AppPaths, AppError> {
    match &config.base_dir {
        Some(base) => Ok(AppPaths::new(base)?),
        None => Ok(AppPaths::from_project_dirs()?),
    }
}

fn init_tracing(level: LevelFilter, paths: &AppPaths, daemon_internal: bool) {
    let log_path = if daemon_internal {
        paths.daemon_log_path()
    } else {
        paths.app_log_path()
    };
    let file = log_path.ok().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    let result = match (file, daemon_internal) {
        (Some(file), true) => {
            let subscriber = fmt()
                .with_max_level(level)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        (Some(file), false) => {
            let subscriber = fmt()
                .with_max_level(level)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stdout.and(Arc::new(file)))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        (None, _) => {
            let subscriber = fmt()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    if result.is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Daemon | Commands::DaemonInternal) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        Some(Commands::Pipeline(_) | Commands::Monitor(_) | Commands::Cancel(_)) => {
            match cli.verbose {
                0 => LevelFilter::WARN,
                1 => LevelFilter::INFO,
                2 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            }
        }
        None => match cli.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

fn make_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:30} {pos}/{len} chunks {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(4));
    pb.enable_steady_tick(Duration::from_millis(250));
    pb
}
