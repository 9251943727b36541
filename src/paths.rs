//! Filesystem layout helpers for chunks, batch results, merged outputs, and logs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Container providing filesystem paths for the scheduler. In production this
/// is rooted at the configured `base_dir` (falling back to the platform data
/// directory); tests construct instances over a temp dir.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under the platform data directory.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = ProjectDirs::from("dev", "batchline", "batchline")
            .ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// LMDB environment directory backing the task/chunk store.
    pub fn store_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["store"])
    }

    /// Log directory (`app.log` for foreground runs, `daemon.log` for the daemon).
    pub fn log_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["log"])
    }

    pub fn app_log_path(&self) -> Result<PathBuf, PathError> {
        Ok(self.log_dir()?.join("app.log"))
    }

    pub fn daemon_log_path(&self) -> Result<PathBuf, PathError> {
        Ok(self.log_dir()?.join("daemon.log"))
    }

    /// Lock file holding the daemon PID. Not created here.
    pub fn daemon_lock_path(&self) -> PathBuf {
        self.base_dir.join(".daemon.lock")
    }

    /// Directory holding the request chunks of one task.
    pub fn chunk_dir(&self, task_id: &str) -> Result<PathBuf, PathError> {
        self.ensure_child(&["chunks", task_id])
    }

    /// Directory for downloaded remote output files of one task.
    pub fn result_output_dir(&self, task_id: &str) -> Result<PathBuf, PathError> {
        self.ensure_child(&["batch_result", task_id, "output"])
    }

    /// Directory for downloaded remote error files of one task.
    pub fn result_error_dir(&self, task_id: &str) -> Result<PathBuf, PathError> {
        self.ensure_child(&["batch_result", task_id, "error"])
    }

    /// Directory for input validation reports of one task.
    pub fn validation_dir(&self, task_id: &str) -> Result<PathBuf, PathError> {
        self.ensure_child(&["batch_result", task_id, "validation"])
    }

    pub fn format_errors_path(&self, task_id: &str) -> Result<PathBuf, PathError> {
        Ok(self.validation_dir(task_id)?.join("format_errors.jsonl"))
    }

    /// Directory for per-round merge artifacts and the final output of one task.
    pub fn merged_dir(&self, task_id: &str) -> Result<PathBuf, PathError> {
        self.ensure_child(&["merged", task_id])
    }

    /// Downloaded remote output for one chunk of one retry round.
    pub fn chunk_output_path(
        &self,
        task_id: &str,
        retry: u32,
        chunk_id: &str,
    ) -> Result<PathBuf, PathError> {
        Ok(self
            .result_output_dir(task_id)?
            .join(format!("retry{retry}_{chunk_id}.jsonl")))
    }

    /// Downloaded remote error file for one chunk of one retry round.
    pub fn chunk_error_path(
        &self,
        task_id: &str,
        retry: u32,
        chunk_id: &str,
    ) -> Result<PathBuf, PathError> {
        Ok(self
            .result_error_dir(task_id)?
            .join(format!("retry{retry}_{chunk_id}.jsonl")))
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}
