//! Background reconciliation loop.
//!
//! One sweep lists the active tasks and advances each in its own worker,
//! joined before the next sweep starts. Within a task, chunks are stepped
//! sequentially so the ghost-chunk guard observes a consistent round, and a
//! chunk is touched at most once per sweep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::paths::AppPaths;
use crate::services::client::BatchClient;
use crate::services::driver::ChunkDriver;
use crate::services::merger;
use crate::store::{current_timestamp_ms, ChunkStatus, Store, TaskStatus, TaskView};

/// Timing knobs; tests shrink these to drive convergence synchronously.
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// How long a task may sit in Stopping before it is force-canceled.
    pub cancel_timeout_ms: i64,
    /// Sleep after a sweep that saw at least one active task.
    pub active_sleep: Duration,
    /// Sleep after a sweep with nothing to do.
    pub idle_sleep: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: 60_000,
            active_sleep: Duration::from_secs(2),
            idle_sleep: Duration::from_secs(5),
        }
    }
}

pub struct Reconciler {
    store: Arc<Store>,
    paths: AppPaths,
    config: Arc<AppConfig>,
    driver: ChunkDriver,
    options: ReconcilerOptions,
    /// Tasks currently inside `process_task`, so a sweep tick firing before
    /// the previous sweep's worker returned cannot re-enter the task.
    in_flight: Mutex<HashSet<String>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        paths: AppPaths,
        config: Arc<AppConfig>,
        client: Arc<dyn BatchClient>,
        options: ReconcilerOptions,
    ) -> Self {
        let driver = ChunkDriver::new(store.clone(), paths.clone(), client);
        Self {
            store,
            paths,
            config,
            driver,
            options,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Sweep until the shutdown channel flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("reconciler started");
        loop {
            let active = match self.clone().sweep().await {
                Ok(active) => active,
                Err(err) => {
                    error!(error = %err, "sweep failed");
                    0
                }
            };
            let delay = if active > 0 {
                self.options.active_sleep
            } else {
                self.options.idle_sleep
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    /// One pass over all active tasks. Returns how many tasks were active.
    pub async fn sweep(self: Arc<Self>) -> Result<usize, crate::store::StoreError> {
        let tasks = self.store.list_active_tasks()?;
        if tasks.is_empty() {
            debug!("no active tasks");
            return Ok(0);
        }

        let mut workers = JoinSet::new();
        for task in &tasks {
            let task_id = task.task_id.clone();
            {
                let mut in_flight = self.in_flight.lock().expect("in_flight mutex");
                if !in_flight.insert(task_id.clone()) {
                    debug!(task_id = %task_id, "task still in flight; skipping");
                    continue;
                }
            }
            let this = self.clone();
            workers.spawn(async move {
                this.process_task(&task_id).await;
                this.in_flight
                    .lock()
                    .expect("in_flight mutex")
                    .remove(&task_id);
            });
        }
        while workers.join_next().await.is_some() {}
        Ok(tasks.len())
    }

    async fn process_task(&self, task_id: &str) {
        let view = match self.store.get_task_view(task_id) {
            Ok(Some(view)) => view,
            Ok(None) => return,
            Err(err) => {
                error!(task_id = %task_id, error = %err, "failed to load task");
                return;
            }
        };
        let task = &view.task;
        if task.status.is_terminal() {
            return;
        }
        // The splitter still owns this task; chunks may be half-written.
        if task.status == TaskStatus::Splitting {
            debug!(task_id = %task_id, "task still splitting; skipping");
            return;
        }

        if task.status == TaskStatus::Stopping {
            let age_ms = current_timestamp_ms() - task.updated_at_ms;
            if age_ms > self.options.cancel_timeout_ms {
                warn!(task_id = %task_id, age_ms, "cancel timed out; force-canceling");
                if let Err(err) = self
                    .store
                    .force_cancel_task(task_id, "force canceled after cancel timeout")
                {
                    error!(task_id = %task_id, error = %err, "force cancel failed");
                }
                return;
            }
        }

        if task.status == TaskStatus::SplitCompleted {
            if let Err(err) =
                self.store
                    .update_task_status(task_id, TaskStatus::Processing, None)
            {
                error!(task_id = %task_id, error = %err, "failed to promote task");
                return;
            }
        }

        let stopping = task.status == TaskStatus::Stopping;
        let (all_done, has_zombies) = self.step_chunks(&view, stopping).await;

        if !all_done || has_zombies {
            return;
        }
        if stopping {
            info!(task_id = %task_id, "all chunks drained; task canceled");
            if let Err(err) = self
                .store
                .update_task_status(task_id, TaskStatus::Canceled, None)
            {
                error!(task_id = %task_id, error = %err, "failed to cancel task");
            }
            return;
        }

        self.merge_and_roll(task_id).await;
    }

    /// Step every chunk of the task's current round once. Returns whether all
    /// non-zombie chunks of the round are terminal, and whether any zombie was
    /// seen (which withholds the merger for this sweep).
    async fn step_chunks(&self, view: &TaskView, stopping: bool) -> (bool, bool) {
        let task = &view.task;
        let mut all_done = true;
        let mut has_zombies = false;

        for chunk in &view.chunks {
            // Ghost guard: a non-terminal chunk from an older round interleaved
            // with a rollover; fail it before any merge may run.
            if chunk.retry != task.retry {
                if !chunk.status.is_terminal() {
                    warn!(
                        chunk_id = %chunk.chunk_id,
                        chunk_retry = chunk.retry,
                        task_retry = task.retry,
                        "zombie chunk detected"
                    );
                    if let Err(err) = self.store.update_chunk_status(
                        &chunk.chunk_id,
                        ChunkStatus::Failed,
                        Some("zombie_chunk_reset".to_string()),
                    ) {
                        error!(chunk_id = %chunk.chunk_id, error = %err, "zombie reset failed");
                    }
                    has_zombies = true;
                    all_done = false;
                }
                continue;
            }

            match chunk.status {
                ChunkStatus::Pending => {
                    all_done = false;
                    if stopping {
                        self.cancel_chunk(&chunk.chunk_id);
                        continue;
                    }
                    if let Err(err) = self.driver.upload(&chunk.chunk_id).await {
                        warn!(chunk_id = %chunk.chunk_id, error = %err, "upload step failed");
                    }
                }
                ChunkStatus::Uploaded => {
                    all_done = false;
                    if stopping {
                        self.cancel_chunk(&chunk.chunk_id);
                        continue;
                    }
                    if let Err(err) = self.driver.create_batch(&chunk.chunk_id).await {
                        warn!(chunk_id = %chunk.chunk_id, error = %err, "create step failed");
                    }
                }
                ChunkStatus::UploadFailed => {
                    // Not terminal: retry the upload on this sweep. Stopping
                    // does not short-circuit here; only Pending and Uploaded
                    // chunks cancel early.
                    all_done = false;
                    if let Err(err) = self.driver.upload(&chunk.chunk_id).await {
                        warn!(chunk_id = %chunk.chunk_id, error = %err, "re-upload step failed");
                    }
                }
                ChunkStatus::Processing => {
                    // Keeps polling even while stopping; the remote batch runs
                    // to completion or expiry.
                    all_done = false;
                    if let Err(err) = self.driver.poll(&chunk.chunk_id).await {
                        warn!(chunk_id = %chunk.chunk_id, error = %err, "poll step failed");
                    }
                }
                ChunkStatus::Processed | ChunkStatus::Failed | ChunkStatus::Canceled => {}
            }
        }
        (all_done, has_zombies)
    }

    fn cancel_chunk(&self, chunk_id: &str) {
        if let Err(err) = self
            .store
            .update_chunk_status(chunk_id, ChunkStatus::Canceled, None)
        {
            error!(chunk_id = %chunk_id, error = %err, "failed to cancel chunk");
        }
    }

    async fn merge_and_roll(&self, task_id: &str) {
        let summary = match merger::merge_round(&self.store, &self.paths, task_id) {
            Ok(summary) => summary,
            Err(err) => {
                // The task stays Processing; the next sweep retries the merge.
                error!(task_id = %task_id, error = %err, "merge failed");
                return;
            }
        };
        if summary.finalized {
            return;
        }
        match merger::retry_rollover(&self.store, &self.paths, &self.config, task_id) {
            Ok(Some(report)) => {
                info!(
                    task_id = %task_id,
                    new_retry = report.new_retry,
                    new_chunks = report.new_chunks,
                    "retry round started"
                );
            }
            Ok(None) => {
                debug!(task_id = %task_id, "no residuals to roll over");
            }
            Err(err) => {
                error!(task_id = %task_id, error = %err, "rollover failed");
            }
        }
    }
}
