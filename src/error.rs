//! Application-level error type shared across the binary and services.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::paths::PathError;
use crate::services::client::ClientError;
use crate::services::driver::DriverError;
use crate::services::merger::MergeError;
use crate::services::splitter::SplitError;
use crate::services::supervisor::SupervisorError;
use crate::store::{StoreError, TaskStatus};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("task `{task_id}` not found")]
    TaskNotFound { task_id: String },
    #[error("task `{task_id}` ended as {}", .status.as_str())]
    TaskEnded {
        task_id: String,
        status: TaskStatus,
    },
}
