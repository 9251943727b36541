//! LMDB-backed persistence for tasks and their chunks.
//!
//! Two flat databases, one row per task and one per chunk. The parent+children
//! view is rebuilt on demand; no in-memory copy is authoritative. Every write
//! is a single committed write transaction, so concurrent sweep workers only
//! ever observe fully applied rows.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

const STORE_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Splitting,
    SplitCompleted,
    Processing,
    Stopping,
    ProcessCompleted,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::ProcessCompleted | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Splitting => "splitting",
            TaskStatus::SplitCompleted => "split_completed",
            TaskStatus::Processing => "processing",
            TaskStatus::Stopping => "stopping",
            TaskStatus::ProcessCompleted => "process_completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

/// Lifecycle state of a chunk within its retry round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Uploaded,
    UploadFailed,
    Processing,
    Processed,
    Failed,
    Canceled,
}

impl ChunkStatus {
    /// Terminal within the chunk's retry round. UploadFailed is not terminal;
    /// the reconciler re-uploads it on the next sweep.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkStatus::Processed | ChunkStatus::Failed | ChunkStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Uploaded => "uploaded",
            ChunkStatus::UploadFailed => "upload_failed",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Processed => "processed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Canceled => "canceled",
        }
    }
}

/// Remote batch status as reported by the serving API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBatchStatus {
    Validating,
    Queueing,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl RemoteBatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteBatchStatus::Validating => "validating",
            RemoteBatchStatus::Queueing => "queueing",
            RemoteBatchStatus::InProgress => "in_progress",
            RemoteBatchStatus::Finalizing => "finalizing",
            RemoteBatchStatus::Completed => "completed",
            RemoteBatchStatus::Failed => "failed",
            RemoteBatchStatus::Expired => "expired",
            RemoteBatchStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

/// Latest polled snapshot of a remote batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJobInfo {
    pub status: RemoteBatchStatus,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub request_counts: RequestCounts,
}

impl BatchJobInfo {
    /// Whether the remote considers the batch terminal.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            RemoteBatchStatus::Completed
                | RemoteBatchStatus::Failed
                | RemoteBatchStatus::Expired
                | RemoteBatchStatus::Cancelled
        )
    }
}

/// Metadata persisted for every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub original_filename: String,
    pub file_path: String,
    pub file_size: u64,
    /// Count of valid records after format validation.
    pub total_lines: u64,
    /// Cumulative chunk count across all retry rounds.
    pub total_chunks: u64,
    pub status: TaskStatus,
    /// Current retry round, starting at 0.
    pub retry: u32,
    pub max_retry: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskRecord {
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        original_filename: impl Into<String>,
        file_path: impl Into<String>,
        file_size: u64,
        max_retry: u32,
    ) -> Self {
        let task_id = task_id.into();
        debug_assert!(!task_id.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            task_id,
            original_filename: original_filename.into(),
            file_path: file_path.into(),
            file_size,
            total_lines: 0,
            total_chunks: 0,
            status: TaskStatus::Splitting,
            retry: 0,
            max_retry,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            error_message: None,
        }
    }
}

/// Metadata persisted for every chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub task_id: String,
    /// Position within the retry round that produced this chunk.
    pub chunk_index: u32,
    /// Retry round that produced this chunk.
    pub retry: u32,
    pub chunk_path: String,
    pub chunk_size: u64,
    pub status: ChunkStatus,
    #[serde(default)]
    pub upload_file_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub batch_info: Option<BatchJobInfo>,
    #[serde(default)]
    pub uploaded_at_ms: Option<i64>,
    #[serde(default)]
    pub processed_at_ms: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ChunkRecord {
    #[must_use]
    pub fn new(
        task_id: &str,
        chunk_index: u32,
        retry: u32,
        chunk_path: impl Into<String>,
        chunk_size: u64,
    ) -> Self {
        debug_assert!(!task_id.is_empty());
        Self {
            chunk_id: chunk_id_for(task_id, chunk_index, retry),
            task_id: task_id.to_string(),
            chunk_index,
            retry,
            chunk_path: chunk_path.into(),
            chunk_size,
            status: ChunkStatus::Pending,
            upload_file_id: None,
            batch_id: None,
            batch_info: None,
            uploaded_at_ms: None,
            processed_at_ms: None,
            error_message: None,
        }
    }
}

/// Unique chunk identifier: `{task_id}[_retry{r}]_chunk_{i}`.
pub fn chunk_id_for(task_id: &str, chunk_index: u32, retry: u32) -> String {
    if retry > 0 {
        format!("{task_id}_retry{retry}_chunk_{chunk_index}")
    } else {
        format!("{task_id}_chunk_{chunk_index}")
    }
}

/// One task together with its chunks, sorted by `(retry, chunk_index)`.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: TaskRecord,
    pub chunks: Vec<ChunkRecord>,
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// Errors emitted by the task/chunk store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("task `{0}` already exists")]
    DuplicateTask(String),
    #[error("chunk `{0}` already exists")]
    DuplicateChunk(String),
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("chunk `{0}` not found")]
    ChunkNotFound(String),
}

/// LMDB-backed store with one `tasks` and one `chunks` database.
#[derive(Debug)]
pub struct Store {
    env: Env,
    tasks: Database<Str, Bytes>,
    chunks: Database<Str, Bytes>,
}

impl Store {
    pub fn open(paths: &AppPaths) -> Result<Self, StoreError> {
        let path = paths.store_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(STORE_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let tasks = open_database(&env, "tasks")?;
        let chunks = open_database(&env, "chunks")?;
        Ok(Self { env, tasks, chunks })
    }

    pub fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        debug_assert!(!task.task_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        if self.tasks.get(&wtxn, task.task_id.as_str())?.is_some() {
            return Err(StoreError::DuplicateTask(task.task_id.clone()));
        }
        let encoded = encode_to_vec(task, config::standard())?;
        self.tasks
            .put(&mut wtxn, task.task_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn task_exists(&self, task_id: &str) -> Result<bool, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.tasks.get(&rtxn, task_id)?.is_some())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        debug_assert!(!task_id.is_empty());
        let rtxn = self.env.read_txn()?;
        match self.tasks.get(&rtxn, task_id)? {
            Some(raw) => {
                let (task, _) = decode_from_slice::<TaskRecord, _>(raw, config::standard())?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Fetch a task joined with its chunks, sorted by `(retry, chunk_index)`.
    pub fn get_task_view(&self, task_id: &str) -> Result<Option<TaskView>, StoreError> {
        let Some(task) = self.get_task(task_id)? else {
            return Ok(None);
        };
        let mut chunks = self.list_chunks(task_id)?;
        chunks.sort_by_key(|c| (c.retry, c.chunk_index));
        Ok(Some(TaskView { task, chunks }))
    }

    /// All chunks belonging to one task, in storage order.
    pub fn list_chunks(&self, task_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.chunks.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (chunk, _) = decode_from_slice::<ChunkRecord, _>(raw, config::standard())?;
            if chunk.task_id == task_id {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    /// Tasks whose status is not terminal, oldest first.
    pub fn list_active_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.tasks.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (task, _) = decode_from_slice::<TaskRecord, _>(raw, config::standard())?;
            if !task.status.is_terminal() {
                out.push(task);
            }
        }
        out.sort_by_key(|t| t.created_at_ms);
        Ok(out)
    }

    pub fn list_all_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.tasks.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (task, _) = decode_from_slice::<TaskRecord, _>(raw, config::standard())?;
            out.push(task);
        }
        out.sort_by_key(|t| t.created_at_ms);
        Ok(out)
    }

    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskRecord, StoreError> {
        self.with_task(task_id, |task| {
            task.status = status;
            if error.is_some() {
                task.error_message = error;
            }
        })
    }

    pub fn update_task_retry(&self, task_id: &str, retry: u32) -> Result<TaskRecord, StoreError> {
        self.with_task(task_id, |task| task.retry = retry)
    }

    pub fn update_task_totals(
        &self,
        task_id: &str,
        total_lines: u64,
        total_chunks: u64,
    ) -> Result<TaskRecord, StoreError> {
        self.with_task(task_id, |task| {
            task.total_lines = total_lines;
            task.total_chunks = total_chunks;
        })
    }

    pub fn add_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        debug_assert!(!chunk.chunk_id.is_empty());
        debug_assert_eq!(chunk.status, ChunkStatus::Pending);
        let mut wtxn = self.env.write_txn()?;
        if self.chunks.get(&wtxn, chunk.chunk_id.as_str())?.is_some() {
            return Err(StoreError::DuplicateChunk(chunk.chunk_id.clone()));
        }
        let encoded = encode_to_vec(chunk, config::standard())?;
        self.chunks
            .put(&mut wtxn, chunk.chunk_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, StoreError> {
        debug_assert!(!chunk_id.is_empty());
        let rtxn = self.env.read_txn()?;
        match self.chunks.get(&rtxn, chunk_id)? {
            Some(raw) => {
                let (chunk, _) = decode_from_slice::<ChunkRecord, _>(raw, config::standard())?;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    pub fn update_chunk_status(
        &self,
        chunk_id: &str,
        status: ChunkStatus,
        error: Option<String>,
    ) -> Result<ChunkRecord, StoreError> {
        self.with_chunk(chunk_id, |chunk| {
            chunk.status = status;
            if error.is_some() {
                chunk.error_message = error;
            }
        })
    }

    /// Persist the remote upload handle and flip the chunk to Uploaded in one
    /// transaction, so a crash can never leave the handle without the status.
    pub fn set_chunk_uploaded(
        &self,
        chunk_id: &str,
        upload_file_id: &str,
    ) -> Result<ChunkRecord, StoreError> {
        debug_assert!(!upload_file_id.is_empty());
        self.with_chunk(chunk_id, |chunk| {
            chunk.upload_file_id = Some(upload_file_id.to_string());
            chunk.status = ChunkStatus::Uploaded;
            chunk.uploaded_at_ms = Some(current_timestamp_ms());
            chunk.error_message = None;
        })
    }

    /// Persist the remote batch handle and flip the chunk to Processing.
    pub fn set_chunk_batch_id(
        &self,
        chunk_id: &str,
        batch_id: &str,
    ) -> Result<ChunkRecord, StoreError> {
        debug_assert!(!batch_id.is_empty());
        self.with_chunk(chunk_id, |chunk| {
            chunk.batch_id = Some(batch_id.to_string());
            chunk.status = ChunkStatus::Processing;
            chunk.error_message = None;
        })
    }

    pub fn set_chunk_batch_info(
        &self,
        chunk_id: &str,
        info: &BatchJobInfo,
    ) -> Result<ChunkRecord, StoreError> {
        self.with_chunk(chunk_id, |chunk| {
            chunk.batch_info = Some(info.clone());
            chunk.processed_at_ms = Some(current_timestamp_ms());
        })
    }

    /// Flip the task and every non-terminal chunk to Canceled.
    pub fn force_cancel_task(&self, task_id: &str, reason: &str) -> Result<(), StoreError> {
        self.with_task(task_id, |task| {
            task.status = TaskStatus::Canceled;
            task.error_message = Some(reason.to_string());
        })?;
        let chunks = self.list_chunks(task_id)?;
        for chunk in chunks {
            if !chunk.status.is_terminal() {
                self.update_chunk_status(&chunk.chunk_id, ChunkStatus::Canceled, None)?;
            }
        }
        Ok(())
    }

    fn with_task<F>(&self, task_id: &str, apply: F) -> Result<TaskRecord, StoreError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        debug_assert!(!task_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let Some(raw) = self.tasks.get(&wtxn, task_id)? else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };
        let (mut task, _) = decode_from_slice::<TaskRecord, _>(raw, config::standard())?;
        apply(&mut task);
        task.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&task, config::standard())?;
        self.tasks.put(&mut wtxn, task_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(task)
    }

    fn with_chunk<F>(&self, chunk_id: &str, apply: F) -> Result<ChunkRecord, StoreError>
    where
        F: FnOnce(&mut ChunkRecord),
    {
        debug_assert!(!chunk_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let Some(raw) = self.chunks.get(&wtxn, chunk_id)? else {
            return Err(StoreError::ChunkNotFound(chunk_id.to_string()));
        };
        let (mut chunk, _) = decode_from_slice::<ChunkRecord, _>(raw, config::standard())?;
        apply(&mut chunk);
        let encoded = encode_to_vec(&chunk, config::standard())?;
        self.chunks.put(&mut wtxn, chunk_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(chunk)
    }
}

fn open_database(env: &Env, name: &str) -> Result<Database<Str, Bytes>, StoreError> {
    let rtxn = env.read_txn()?;
    let opened = env.open_database::<Str, Bytes>(&rtxn, Some(name))?;
    drop(rtxn);
    match opened {
        Some(existing) => Ok(existing),
        None => {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, Bytes>(&mut wtxn, Some(name))?;
            wtxn.commit()?;
            Ok(db)
        }
    }
}
