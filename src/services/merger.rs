//! Per-round result merging, residual computation, and retry rollover.
//!
//! Runs only once every chunk of the current retry round is terminal. The
//! merged output of a round keeps exactly the lines the classifier accepted
//! as genuine responses, so the final `output.jsonl` holds one line per
//! succeeded custom_id across all rounds with no duplicates.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::paths::{AppPaths, PathError};
use crate::services::classifier::{FailureRecord, LineDisposition, RoundClassification};
use crate::services::splitter::{self, SplitError};
use crate::store::{Store, StoreError, TaskStatus};

/// How many offending chunk ids an incomplete-round error names.
const REPORTED_CHUNK_IDS: usize = 5;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("retry round {retry} still has non-terminal chunks: {chunk_ids:?}")]
    RoundIncomplete {
        retry: u32,
        chunk_ids: Vec<String>,
    },
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of merging one retry round.
#[derive(Debug, Clone)]
pub struct MergeSummary {
    pub retry: u32,
    pub output_records: u64,
    pub residual: u64,
    pub fatal: u64,
    /// Whether the task was finalized (final output written, task terminal).
    pub finalized: bool,
}

/// Result of one retry rollover.
#[derive(Debug, Clone)]
pub struct RolloverReport {
    pub new_retry: u32,
    pub new_chunks: u32,
    pub residual: u64,
}

/// Merge the current retry round of a task: concatenate accepted responses,
/// classify failures, emit the residual set and the failure analysis report,
/// and finalize the task when the round was the last one.
pub fn merge_round(
    store: &Store,
    paths: &AppPaths,
    task_id: &str,
) -> Result<MergeSummary, MergeError> {
    let view = store
        .get_task_view(task_id)?
        .ok_or_else(|| MergeError::TaskNotFound(task_id.to_string()))?;
    let retry = view.task.retry;

    let round: Vec<_> = view.chunks.iter().filter(|c| c.retry == retry).collect();
    let stuck: Vec<String> = round
        .iter()
        .filter(|c| !c.status.is_terminal())
        .map(|c| c.chunk_id.clone())
        .take(REPORTED_CHUNK_IDS)
        .collect();
    if !stuck.is_empty() {
        return Err(MergeError::RoundIncomplete {
            retry,
            chunk_ids: stuck,
        });
    }
    if round.is_empty() {
        // Nothing was chunked for this round; finalize with what earlier
        // rounds produced rather than leaving the task stuck.
        warn!(task_id = %task_id, retry, "retry round has no chunks; finalizing");
        let output_records = finalize(store, paths, task_id, retry)?;
        return Ok(MergeSummary {
            retry,
            output_records,
            residual: 0,
            fatal: 0,
            finalized: true,
        });
    }

    let mut classification = RoundClassification::default();
    let mut output_lines: Vec<String> = Vec::new();
    for chunk in &round {
        let output_path = paths.chunk_output_path(task_id, retry, &chunk.chunk_id)?;
        absorb_result_file(&output_path, &mut classification, &mut output_lines, false)?;
        let error_path = paths.chunk_error_path(task_id, retry, &chunk.chunk_id)?;
        absorb_result_file(&error_path, &mut classification, &mut output_lines, true)?;
    }

    // Residual = every input record of this round that neither succeeded nor
    // failed fatally; the lines are already request-shaped.
    let mut residual_lines: Vec<String> = Vec::new();
    for chunk in &round {
        let chunk_path = Path::new(&chunk.chunk_path);
        if !chunk_path.exists() {
            warn!(chunk_id = %chunk.chunk_id, path = %chunk.chunk_path, "chunk file missing");
            continue;
        }
        for line in read_lines(chunk_path)? {
            let Some(custom_id) = parse_custom_id(&line) else {
                warn!(chunk_id = %chunk.chunk_id, "chunk line without custom_id");
                continue;
            };
            if classification.is_residual(&custom_id) {
                residual_lines.push(line);
            }
        }
    }

    let merged_dir = paths.merged_dir(task_id)?;
    write_lines(
        &merged_dir.join(format!("output_retry{retry}.jsonl")),
        &output_lines,
    )?;
    write_lines(
        &merged_dir.join(format!("missing_records_retry{retry}.jsonl")),
        &residual_lines,
    )?;
    if !classification.failures.is_empty() {
        let report_path = merged_dir.join(format!("failure_analysis_retry{retry}.csv"));
        write_failure_report(&report_path, &classification.failures)?;
        info!(task_id = %task_id, report = %report_path.display(), "failure analysis written");
    }

    let residual = residual_lines.len() as u64;
    let fatal = classification.fatal.len() as u64;
    let last_round = retry >= view.task.max_retry;
    info!(
        task_id = %task_id,
        retry,
        output = output_lines.len(),
        residual,
        fatal,
        "round merged"
    );

    if residual == 0 || last_round {
        let output_records = finalize(store, paths, task_id, retry)?;
        return Ok(MergeSummary {
            retry,
            output_records,
            residual,
            fatal,
            finalized: true,
        });
    }

    Ok(MergeSummary {
        retry,
        output_records: output_lines.len() as u64,
        residual,
        fatal,
        finalized: false,
    })
}

/// Re-chunk the residual set of the current round at `retry + 1`. Returns
/// `None` when the residual file is empty and there is nothing to roll over.
pub fn retry_rollover(
    store: &Store,
    paths: &AppPaths,
    config: &AppConfig,
    task_id: &str,
) -> Result<Option<RolloverReport>, MergeError> {
    let task = store
        .get_task(task_id)?
        .ok_or_else(|| MergeError::TaskNotFound(task_id.to_string()))?;
    let missing_path = paths
        .merged_dir(task_id)?
        .join(format!("missing_records_retry{}.jsonl", task.retry));
    if !missing_path.exists() {
        return Ok(None);
    }
    let residual_lines = read_lines(&missing_path)?;
    if residual_lines.is_empty() {
        return Ok(None);
    }

    let new_retry = task.retry + 1;
    let task = store.update_task_retry(task_id, new_retry)?;
    let new_chunks = splitter::write_residual_chunks(
        store,
        paths,
        &task,
        new_retry,
        &residual_lines,
        config.lines_per_chunk,
        config.chunk_max_bytes,
    )?;
    store.update_task_totals(
        task_id,
        task.total_lines,
        task.total_chunks + u64::from(new_chunks),
    )?;
    info!(
        task_id = %task_id,
        new_retry,
        new_chunks,
        residual = residual_lines.len(),
        "residuals re-chunked for the next round"
    );
    Ok(Some(RolloverReport {
        new_retry,
        new_chunks,
        residual: residual_lines.len() as u64,
    }))
}

/// Concatenate the per-round outputs into the final `output.jsonl` and mark
/// the task ProcessCompleted.
fn finalize(
    store: &Store,
    paths: &AppPaths,
    task_id: &str,
    retry: u32,
) -> Result<u64, MergeError> {
    let merged_dir = paths.merged_dir(task_id)?;
    let mut all_lines: Vec<String> = Vec::new();
    for round in 0..=retry {
        let round_path = merged_dir.join(format!("output_retry{round}.jsonl"));
        if round_path.exists() {
            all_lines.extend(read_lines(&round_path)?);
        }
    }
    let final_path = merged_dir.join("output.jsonl");
    write_lines(&final_path, &all_lines)?;
    store.update_task_status(task_id, TaskStatus::ProcessCompleted, None)?;
    info!(
        task_id = %task_id,
        records = all_lines.len(),
        output = %final_path.display(),
        "task finalized"
    );
    Ok(all_lines.len() as u64)
}

fn absorb_result_file(
    path: &Path,
    classification: &mut RoundClassification,
    output_lines: &mut Vec<String>,
    is_error_file: bool,
) -> Result<(), MergeError> {
    if !path.exists() {
        return Ok(());
    }
    for line in read_lines(path)? {
        let disposition = if is_error_file {
            classification.absorb_error_line(&line)
        } else {
            classification.absorb_output_line(&line)
        };
        match disposition {
            LineDisposition::Success => output_lines.push(line),
            LineDisposition::Failure | LineDisposition::DuplicateSuccess => {}
            LineDisposition::Unparseable => {
                warn!(path = %path.display(), "skipping unparseable result line");
            }
        }
    }
    Ok(())
}

fn parse_custom_id(line: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(line).ok()?;
    value
        .get("custom_id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

fn read_lines(path: &Path) -> Result<Vec<String>, MergeError> {
    let file = File::open(path).map_err(|source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| MergeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), MergeError> {
    let file = File::create(path).map_err(|source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writeln!(writer, "{line}").map_err(|source| MergeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    writer.flush().map_err(|source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Operator-facing failure report: UTF-8 BOM so spreadsheet tools detect the
/// encoding, one row per failed record.
fn write_failure_report(path: &Path, failures: &[FailureRecord]) -> Result<(), MergeError> {
    let file = File::create(path).map_err(|source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    let io_err = |source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    };
    writer.write_all(b"\xEF\xBB\xBF").map_err(io_err)?;
    writeln!(
        writer,
        "custom_id,status,http_status,error_code,error_message,suggested_action"
    )
    .map_err(io_err)?;
    for failure in failures {
        let (status, action) = if failure.fatal {
            ("abandoned", "check prompt length, request format, or model name")
        } else {
            ("retry", "retried automatically on the next round")
        };
        writeln!(
            writer,
            "{},{},{},{},{},{}",
            csv_field(&failure.custom_id),
            status,
            failure.status_code,
            csv_field(&failure.error_code),
            csv_field(&failure.error_message),
            action,
        )
        .map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
