//! Task progress summaries for the monitor and pipeline tailing.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::store::{ChunkStatus, TaskStatus, TaskView};

/// Per-chunk remote progress while a batch is in flight.
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    pub chunk_id: String,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Aggregated view of one task, rebuilt from the store on every refresh.
#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub task_id: String,
    pub original_filename: String,
    pub status: TaskStatus,
    pub retry: u32,
    pub max_retry: u32,
    pub total_lines: u64,
    pub total_chunks: u64,
    pub counts: BTreeMap<ChunkStatus, usize>,
    pub by_retry: BTreeMap<u32, BTreeMap<ChunkStatus, usize>>,
    pub completed_records: u64,
    pub failed_records: u64,
    pub processing: Vec<ChunkProgress>,
    pub error_message: Option<String>,
}

impl StatusSummary {
    pub fn of(view: &TaskView) -> Self {
        let mut counts: BTreeMap<ChunkStatus, usize> = BTreeMap::new();
        let mut by_retry: BTreeMap<u32, BTreeMap<ChunkStatus, usize>> = BTreeMap::new();
        let mut completed_records = 0u64;
        let mut failed_records = 0u64;
        let mut processing = Vec::new();

        for chunk in &view.chunks {
            *counts.entry(chunk.status).or_default() += 1;
            *by_retry
                .entry(chunk.retry)
                .or_default()
                .entry(chunk.status)
                .or_default() += 1;
            if let Some(info) = &chunk.batch_info {
                completed_records += info.request_counts.completed;
                failed_records += info.request_counts.failed;
                if chunk.status == ChunkStatus::Processing {
                    processing.push(ChunkProgress {
                        chunk_id: chunk.chunk_id.clone(),
                        total: info.request_counts.total,
                        completed: info.request_counts.completed,
                        failed: info.request_counts.failed,
                    });
                }
            }
        }

        Self {
            task_id: view.task.task_id.clone(),
            original_filename: view.task.original_filename.clone(),
            status: view.task.status,
            retry: view.task.retry,
            max_retry: view.task.max_retry,
            total_lines: view.task.total_lines,
            total_chunks: view.task.total_chunks,
            counts,
            by_retry,
            completed_records,
            failed_records,
            processing,
            error_message: view.task.error_message.clone(),
        }
    }

    pub fn count(&self, status: ChunkStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Chunks terminal within their round, across all rounds.
    pub fn done_chunks(&self) -> usize {
        self.count(ChunkStatus::Processed)
            + self.count(ChunkStatus::Failed)
            + self.count(ChunkStatus::Canceled)
    }

    /// Multi-line human rendering used by `monitor` and pipeline tailing.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "task {} ({}) status={} retry={}/{} lines={} chunks={}",
            self.task_id,
            self.original_filename,
            self.status.as_str(),
            self.retry,
            self.max_retry,
            self.total_lines,
            self.total_chunks,
        );
        for (retry, statuses) in &self.by_retry {
            let mut parts: Vec<String> = Vec::new();
            for (status, count) in statuses {
                parts.push(format!("{}={}", status.as_str(), count));
            }
            let _ = writeln!(out, "  round {retry}: {}", parts.join(" "));
        }
        if self.completed_records > 0 || self.failed_records > 0 {
            let _ = writeln!(
                out,
                "  records: completed={} failed={}",
                self.completed_records, self.failed_records
            );
        }
        for progress in &self.processing {
            let _ = writeln!(
                out,
                "  in flight {}: {}/{} completed, {} failed",
                progress.chunk_id, progress.completed, progress.total, progress.failed
            );
        }
        if let Some(error) = &self.error_message {
            let _ = writeln!(out, "  error: {error}");
        }
        out
    }
}
