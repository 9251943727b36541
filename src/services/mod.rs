//! Scheduler services coordinating the store, the filesystem, and the remote
//! batch API. Pure transforms (classification, summaries) live beside the
//! IO-bound drivers they feed so the reconciler stays a thin loop.

pub mod classifier;
pub mod client;
pub mod driver;
pub mod merger;
pub mod reconciler;
pub mod splitter;
pub mod status;
pub mod supervisor;

pub use classifier::{FailureRecord, LineDisposition, RoundClassification};
pub use client::{BatchClient, ClientError, HttpBatchClient};
pub use driver::{ChunkDriver, DriverError};
pub use merger::{MergeError, MergeSummary, RolloverReport};
pub use reconciler::{Reconciler, ReconcilerOptions};
pub use splitter::{generate_task_id, split_file, SplitError, SplitReport};
pub use status::{ChunkProgress, StatusSummary};
pub use supervisor::{
    ensure_daemon, live_daemon_pid, run_daemon_internal, DaemonLaunch, LockGuard, SupervisorError,
};
