//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

use crate::config::MAX_LINES_PER_CHUNK;

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "batchline",
    version,
    about = "Offline batch inference scheduler"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
    /// YAML configuration file.
    #[arg(global = true, long = "config", default_value = "./config.yaml")]
    pub config: PathBuf,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Split an input file (or resume an existing task) and stream its status
    /// until it reaches a terminal state.
    Pipeline(PipelineArgs),
    /// Request cancellation of a task and return immediately.
    Cancel(CancelArgs),
    /// Render live task status; without a task id, list all active tasks.
    Monitor(MonitorArgs),
    /// Start the background daemon (idempotent; at most one per host).
    Daemon,
    /// Internal daemon child entry point.
    #[command(name = "daemon-internal", hide = true)]
    DaemonInternal,
}

#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// JSONL input file with one chat request per line.
    pub input: PathBuf,
    /// Task identifier; generated from timestamp and randomness when omitted.
    #[arg(long = "task-id", value_parser = validate_task_id)]
    pub task_id: Option<String>,
    /// Override the configured request lines per chunk (1-50000).
    #[arg(long = "lines-per-chunk", value_parser = validate_lines_per_chunk)]
    pub lines_per_chunk: Option<usize>,
}

#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Task to cancel.
    #[arg(value_parser = validate_task_id)]
    pub task_id: String,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Task to monitor; omit to list all active tasks.
    #[arg(value_parser = validate_task_id)]
    pub task_id: Option<String>,
}

/// Validate task id: ASCII letters, digits, hyphens, underscores, length 1..=64.
/// Task ids become directory names, so path separators are out.
fn validate_task_id(s: &str) -> Result<String, String> {
    if s.is_empty() {
        return Err("task id cannot be empty".to_string());
    }
    if s.len() > 64 {
        return Err(format!("task id too long: {} chars (max 64)", s.len()));
    }
    if !s
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(
            "task id must contain only ASCII letters, digits, hyphens, and underscores"
                .to_string(),
        );
    }
    Ok(s.to_string())
}

fn validate_lines_per_chunk(s: &str) -> Result<usize, String> {
    let value = s
        .parse::<usize>()
        .map_err(|_| format!("invalid number: {s}"))?;
    if value == 0 {
        return Err("lines per chunk must be at least 1".to_string());
    }
    if value > MAX_LINES_PER_CHUNK {
        return Err(format!(
            "lines per chunk cannot exceed {MAX_LINES_PER_CHUNK}"
        ));
    }
    Ok(value)
}
