//! Single-step chunk advancement.
//!
//! Each call moves one chunk forward by at most one state transition and is
//! idempotent: remote handles are persisted in the same transaction as the
//! status flip, so a repeated call observes the stored identifier instead of
//! creating a duplicate remote artifact.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::paths::{AppPaths, PathError};
use crate::services::client::{BatchClient, ClientError};
use crate::store::{ChunkRecord, ChunkStatus, RemoteBatchStatus, Store, StoreError};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("chunk `{0}` has no upload_file_id")]
    MissingUploadId(String),
    #[error("chunk `{0}` has no batch_id")]
    MissingBatchId(String),
}

/// Drives one chunk one step forward against the remote batch API.
pub struct ChunkDriver {
    store: Arc<Store>,
    paths: AppPaths,
    client: Arc<dyn BatchClient>,
}

impl ChunkDriver {
    pub fn new(store: Arc<Store>, paths: AppPaths, client: Arc<dyn BatchClient>) -> Self {
        Self {
            store,
            paths,
            client,
        }
    }

    /// PENDING / UPLOAD_FAILED → UPLOADED, or UPLOAD_FAILED on rejection.
    pub async fn upload(&self, chunk_id: &str) -> Result<(), DriverError> {
        let chunk = self.fetch(chunk_id)?;
        if chunk.upload_file_id.is_some() {
            self.store
                .update_chunk_status(chunk_id, ChunkStatus::Uploaded, None)?;
            return Ok(());
        }

        match self
            .client
            .upload_file(std::path::Path::new(&chunk.chunk_path))
            .await
        {
            Ok(upload_file_id) => {
                self.store.set_chunk_uploaded(chunk_id, &upload_file_id)?;
                info!(chunk_id = %chunk_id, upload_file_id = %upload_file_id, "chunk uploaded");
                Ok(())
            }
            Err(err) => {
                warn!(chunk_id = %chunk_id, error = %err, "chunk upload failed");
                self.store.update_chunk_status(
                    chunk_id,
                    ChunkStatus::UploadFailed,
                    Some(err.to_string()),
                )?;
                Ok(())
            }
        }
    }

    /// UPLOADED → PROCESSING. Not retried within a single call; a failed
    /// creation leaves the chunk Uploaded for the next sweep.
    pub async fn create_batch(&self, chunk_id: &str) -> Result<(), DriverError> {
        let chunk = self.fetch(chunk_id)?;
        if chunk.batch_id.is_some() {
            self.store
                .update_chunk_status(chunk_id, ChunkStatus::Processing, None)?;
            return Ok(());
        }
        let upload_file_id = chunk
            .upload_file_id
            .ok_or_else(|| DriverError::MissingUploadId(chunk_id.to_string()))?;

        match self.client.create_batch(&upload_file_id).await {
            Ok(batch_id) => {
                self.store.set_chunk_batch_id(chunk_id, &batch_id)?;
                info!(chunk_id = %chunk_id, batch_id = %batch_id, "batch created");
                Ok(())
            }
            Err(err) => {
                warn!(chunk_id = %chunk_id, error = %err, "batch creation failed");
                self.store.update_chunk_status(
                    chunk_id,
                    ChunkStatus::Uploaded,
                    Some(err.to_string()),
                )?;
                Ok(())
            }
        }
    }

    /// PROCESSING → PROCESSED/FAILED once the remote is terminal; returns
    /// whether the chunk reached a terminal state. Download failures keep the
    /// chunk Processing so the next sweep re-polls.
    pub async fn poll(&self, chunk_id: &str) -> Result<bool, DriverError> {
        let chunk = self.fetch(chunk_id)?;
        if chunk.status.is_terminal() {
            return Ok(true);
        }
        let batch_id = chunk
            .batch_id
            .clone()
            .ok_or_else(|| DriverError::MissingBatchId(chunk_id.to_string()))?;

        let info = self.client.get_batch(&batch_id).await?;
        self.store.set_chunk_batch_info(chunk_id, &info)?;
        if !info.is_finished() {
            return Ok(false);
        }

        if let Some(output_file_id) = info.output_file_id.as_deref() {
            self.download(chunk_id, &chunk, output_file_id, false).await?;
        }
        if let Some(error_file_id) = info.error_file_id.as_deref() {
            self.download(chunk_id, &chunk, error_file_id, true).await?;
        }

        if info.status == RemoteBatchStatus::Completed {
            self.store
                .update_chunk_status(chunk_id, ChunkStatus::Processed, None)?;
            info!(chunk_id = %chunk_id, "chunk processed");
        } else {
            let reason = format!("remote batch ended as {}", info.status.as_str());
            warn!(chunk_id = %chunk_id, status = info.status.as_str(), "chunk failed remotely");
            self.store
                .update_chunk_status(chunk_id, ChunkStatus::Failed, Some(reason))?;
        }
        Ok(true)
    }

    async fn download(
        &self,
        chunk_id: &str,
        chunk: &ChunkRecord,
        file_id: &str,
        is_error: bool,
    ) -> Result<(), DriverError> {
        let content = self.client.get_file_content(file_id).await?;
        let path = if is_error {
            self.paths
                .chunk_error_path(&chunk.task_id, chunk.retry, chunk_id)?
        } else {
            self.paths
                .chunk_output_path(&chunk.task_id, chunk.retry, chunk_id)?
        };
        std::fs::write(&path, content).map_err(|source| DriverError::Io { path, source })?;
        Ok(())
    }

    fn fetch(&self, chunk_id: &str) -> Result<ChunkRecord, DriverError> {
        self.store
            .get_chunk(chunk_id)?
            .ok_or_else(|| DriverError::Store(StoreError::ChunkNotFound(chunk_id.to_string())))
    }
}
