//! End-to-end scheduler scenarios against an in-process fake remote.
//!
//! The fake implements the batch API surface (upload, create, poll, download)
//! with scripted per-record outcomes, so the reconciler can be driven sweep by
//! sweep over a real store and filesystem.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;

use batchline::config::{
    AppConfig, ModelConfig, ValidationMode, MAX_CHUNK_BYTES, MAX_LINE_BYTES,
};
use batchline::paths::AppPaths;
use batchline::services::client::{BatchClient, ClientError};
use batchline::services::reconciler::{Reconciler, ReconcilerOptions};
use batchline::services::splitter;
use batchline::store::{
    BatchJobInfo, ChunkStatus, RemoteBatchStatus, RequestCounts, Store, TaskStatus,
};

/// Scripted outcome for one record submission.
#[derive(Debug, Clone)]
enum Outcome {
    Success,
    Error { status: u16, code: &'static str },
}

#[derive(Debug, Default)]
struct FakeState {
    files: HashMap<String, Vec<u8>>,
    batches: HashMap<String, FakeBatch>,
    outcomes: HashMap<String, VecDeque<Outcome>>,
    upload_count: usize,
    create_count: usize,
    next_id: usize,
}

#[derive(Debug, Clone)]
struct FakeBatch {
    input_file_id: String,
    polls: u32,
    info: Option<BatchJobInfo>,
}

/// In-process stand-in for the remote batch API.
struct FakeRemote {
    state: Mutex<FakeState>,
    /// Polls a batch reports as in-progress before turning terminal.
    polls_until_done: u32,
    /// When set, batches end in this state with no result files.
    terminal_status: RemoteBatchStatus,
    /// While set, every upload attempt is rejected.
    fail_uploads: AtomicBool,
}

impl FakeRemote {
    fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            polls_until_done: 1,
            terminal_status: RemoteBatchStatus::Completed,
            fail_uploads: AtomicBool::new(false),
        }
    }

    fn script(&self, custom_id: &str, outcomes: Vec<Outcome>) {
        self.state
            .lock()
            .expect("state mutex")
            .outcomes
            .insert(custom_id.to_string(), outcomes.into());
    }

    fn upload_count(&self) -> usize {
        self.state.lock().expect("state mutex").upload_count
    }

    fn create_count(&self) -> usize {
        self.state.lock().expect("state mutex").create_count
    }

    /// Take the next scripted outcome for a record; the last one repeats.
    fn next_outcome(state: &mut FakeState, custom_id: &str) -> Outcome {
        match state.outcomes.get_mut(custom_id) {
            Some(deque) if deque.len() > 1 => deque.pop_front().expect("non-empty deque"),
            Some(deque) => deque.front().cloned().unwrap_or(Outcome::Success),
            None => Outcome::Success,
        }
    }

    fn finish_batch(state: &mut FakeState, batch_id: &str, status: RemoteBatchStatus) {
        let batch = state.batches.get(batch_id).cloned().expect("known batch");
        if status != RemoteBatchStatus::Completed {
            let info = BatchJobInfo {
                status,
                output_file_id: None,
                error_file_id: None,
                request_counts: RequestCounts::default(),
            };
            state.batches.get_mut(batch_id).expect("known batch").info = Some(info);
            return;
        }

        let input = state
            .files
            .get(&batch.input_file_id)
            .cloned()
            .unwrap_or_default();
        let text = String::from_utf8(input).expect("request file is UTF-8");
        let mut output_lines = Vec::new();
        let mut error_lines = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let request: JsonValue = serde_json::from_str(line).expect("request json");
            let custom_id = request["custom_id"].as_str().expect("custom_id").to_string();
            match Self::next_outcome(state, &custom_id) {
                Outcome::Success => output_lines.push(
                    json!({
                        "custom_id": custom_id,
                        "response": {
                            "status_code": 200,
                            "body": {"code": 0, "content": "ok"},
                        }
                    })
                    .to_string(),
                ),
                Outcome::Error { status, code } => error_lines.push(
                    json!({
                        "custom_id": custom_id,
                        "response": {
                            "status_code": status,
                            "body": {"error": {"code": code, "message": "scripted failure"}},
                        }
                    })
                    .to_string(),
                ),
            }
        }

        let total = (output_lines.len() + error_lines.len()) as u64;
        let completed = output_lines.len() as u64;
        let failed = error_lines.len() as u64;

        let output_file_id = if output_lines.is_empty() {
            None
        } else {
            state.next_id += 1;
            let id = format!("out-{}", state.next_id);
            state
                .files
                .insert(id.clone(), format!("{}\n", output_lines.join("\n")).into_bytes());
            Some(id)
        };
        let error_file_id = if error_lines.is_empty() {
            None
        } else {
            state.next_id += 1;
            let id = format!("err-{}", state.next_id);
            state
                .files
                .insert(id.clone(), format!("{}\n", error_lines.join("\n")).into_bytes());
            Some(id)
        };

        let info = BatchJobInfo {
            status: RemoteBatchStatus::Completed,
            output_file_id,
            error_file_id,
            request_counts: RequestCounts {
                total,
                completed,
                failed,
            },
        };
        state.batches.get_mut(batch_id).expect("known batch").info = Some(info);
    }
}

#[async_trait]
impl BatchClient for FakeRemote {
    async fn upload_file(&self, path: &Path) -> Result<String, ClientError> {
        let data = fs::read(path).map_err(|source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut state = self.state.lock().expect("state mutex");
        state.upload_count += 1;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ClientError::MissingField { field: "id" });
        }
        state.next_id += 1;
        let id = format!("file-{}", state.next_id);
        state.files.insert(id.clone(), data);
        Ok(id)
    }

    async fn create_batch(&self, upload_file_id: &str) -> Result<String, ClientError> {
        let mut state = self.state.lock().expect("state mutex");
        state.create_count += 1;
        state.next_id += 1;
        let id = format!("batch-{}", state.next_id);
        state.batches.insert(
            id.clone(),
            FakeBatch {
                input_file_id: upload_file_id.to_string(),
                polls: 0,
                info: None,
            },
        );
        Ok(id)
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchJobInfo, ClientError> {
        let mut state = self.state.lock().expect("state mutex");
        let polls = {
            let batch = state.batches.get_mut(batch_id).expect("known batch");
            if let Some(info) = &batch.info {
                return Ok(info.clone());
            }
            batch.polls += 1;
            batch.polls
        };
        if polls <= self.polls_until_done {
            return Ok(BatchJobInfo {
                status: RemoteBatchStatus::InProgress,
                output_file_id: None,
                error_file_id: None,
                request_counts: RequestCounts::default(),
            });
        }
        Self::finish_batch(&mut state, batch_id, self.terminal_status);
        Ok(state.batches[batch_id].info.clone().expect("finished info"))
    }

    async fn get_file_content(&self, file_id: &str) -> Result<Vec<u8>, ClientError> {
        Ok(self
            .state
            .lock()
            .expect("state mutex")
            .files
            .get(file_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cancel_batch(&self, _batch_id: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

struct Harness {
    _temp: TempDir,
    paths: AppPaths,
    store: Arc<Store>,
    config: Arc<AppConfig>,
    remote: Arc<FakeRemote>,
    reconciler: Arc<Reconciler>,
}

fn test_config(max_retry: u32, lines_per_chunk: usize) -> AppConfig {
    AppConfig {
        model: ModelConfig {
            domain: "spark-pro".to_string(),
            max_tokens: 512,
            messages_key: "messages".to_string(),
            password: "secret".to_string(),
            base_url: "https://example.com".to_string(),
            temperature: None,
            top_p: None,
            enable_thinking: None,
            extra_body: None,
        },
        test_lines: -1,
        max_retry_count: max_retry,
        lines_per_chunk,
        validation: ValidationMode::Lenient,
        base_dir: None,
        chunk_max_bytes: MAX_CHUNK_BYTES,
        max_line_bytes: MAX_LINE_BYTES,
    }
}

fn harness(remote: FakeRemote, config: AppConfig, options: ReconcilerOptions) -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path().join("base")).expect("paths");
    let store = Arc::new(Store::open(&paths).expect("store"));
    let config = Arc::new(config);
    let remote = Arc::new(remote);
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        paths.clone(),
        config.clone(),
        remote.clone(),
        options,
    ));
    Harness {
        _temp: temp,
        paths,
        store,
        config,
        remote,
        reconciler,
    }
}

fn write_input(harness: &Harness, lines: &[String]) -> PathBuf {
    let input = harness.paths.base_dir().join("input.jsonl");
    fs::write(&input, format!("{}\n", lines.join("\n"))).expect("write input");
    input
}

fn user_line(content: &str) -> String {
    json!({"messages": [{"role": "user", "content": content}]}).to_string()
}

fn split(harness: &Harness, task_id: &str, input: &Path) {
    splitter::split_file(
        &harness.store,
        &harness.paths,
        &harness.config,
        input,
        task_id,
        None,
    )
    .expect("split succeeds");
}

async fn run_until_terminal(harness: &Harness, task_id: &str, max_sweeps: usize) -> TaskStatus {
    for _ in 0..max_sweeps {
        harness
            .reconciler
            .clone()
            .sweep()
            .await
            .expect("sweep succeeds");
        let task = harness
            .store
            .get_task(task_id)
            .expect("get task")
            .expect("task present");
        if task.status.is_terminal() {
            return task.status;
        }
    }
    panic!("task {task_id} did not reach a terminal state in {max_sweeps} sweeps");
}

fn merged_lines(harness: &Harness, task_id: &str, filename: &str) -> Vec<String> {
    let path = harness
        .paths
        .merged_dir(task_id)
        .expect("merged dir")
        .join(filename);
    if !path.exists() {
        return Vec::new();
    }
    fs::read_to_string(path)
        .expect("read merged file")
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn custom_ids(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| {
            let value: JsonValue = serde_json::from_str(line).expect("json line");
            value["custom_id"].as_str().expect("custom_id").to_string()
        })
        .collect()
}

#[tokio::test]
async fn happy_path_produces_one_response_per_line() {
    let harness = harness(
        FakeRemote::new(),
        test_config(1, 1),
        ReconcilerOptions::default(),
    );
    let input = write_input(&harness, &[user_line("a"), user_line("b")]);
    split(&harness, "t-happy", &input);

    let status = run_until_terminal(&harness, "t-happy", 20).await;
    assert_eq!(status, TaskStatus::ProcessCompleted);

    let output = merged_lines(&harness, "t-happy", "output.jsonl");
    assert_eq!(custom_ids(&output), vec!["0", "1"]);
    assert!(merged_lines(&harness, "t-happy", "missing_records_retry0.jsonl").is_empty());

    let view = harness
        .store
        .get_task_view("t-happy")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks.len(), 2);
    assert!(view
        .chunks
        .iter()
        .all(|c| c.status == ChunkStatus::Processed));
    assert_eq!(view.task.retry, 0);
}

#[tokio::test]
async fn transient_failure_retries_and_fatal_is_abandoned() {
    let remote = FakeRemote::new();
    remote.script("1", vec![Outcome::Error { status: 429, code: "" }, Outcome::Success]);
    remote.script(
        "2",
        vec![Outcome::Error {
            status: 500,
            code: "context_length_exceeded",
        }],
    );
    let harness = harness(remote, test_config(2, 1000), ReconcilerOptions::default());
    let input = write_input(&harness, &[user_line("a"), user_line("b"), user_line("c")]);
    split(&harness, "t-mixed", &input);

    let status = run_until_terminal(&harness, "t-mixed", 30).await;
    assert_eq!(status, TaskStatus::ProcessCompleted);

    let mut ids = custom_ids(&merged_lines(&harness, "t-mixed", "output.jsonl"));
    ids.sort();
    assert_eq!(ids, vec!["0", "1"]);

    let view = harness
        .store
        .get_task_view("t-mixed")
        .expect("view")
        .expect("task");
    assert_eq!(view.task.retry, 1);
    assert_eq!(view.task.total_chunks, 2);

    // Round 0 named the 429 retryable and the context overflow fatal.
    let report_path = harness
        .paths
        .merged_dir("t-mixed")
        .expect("merged dir")
        .join("failure_analysis_retry0.csv");
    let report = fs::read_to_string(report_path).expect("failure report");
    assert!(report.contains("1,retry,429"));
    assert!(report.contains("2,abandoned,500,context_length_exceeded"));

    // The fatal record is nobody's residual by round 1.
    assert!(merged_lines(&harness, "t-mixed", "missing_records_retry1.jsonl").is_empty());
}

#[tokio::test]
async fn persistent_transient_failures_stop_at_max_retry() {
    let remote = FakeRemote::new();
    remote.script("0", vec![Outcome::Error { status: 500, code: "" }]);
    remote.script("1", vec![Outcome::Error { status: 500, code: "" }]);
    let harness = harness(remote, test_config(1, 1000), ReconcilerOptions::default());
    let input = write_input(&harness, &[user_line("a"), user_line("b")]);
    split(&harness, "t-exhaust", &input);

    let status = run_until_terminal(&harness, "t-exhaust", 30).await;
    assert_eq!(status, TaskStatus::ProcessCompleted);

    assert!(merged_lines(&harness, "t-exhaust", "output.jsonl").is_empty());
    let residual = merged_lines(&harness, "t-exhaust", "missing_records_retry1.jsonl");
    assert_eq!(custom_ids(&residual).len(), 2);

    let view = harness
        .store
        .get_task_view("t-exhaust")
        .expect("view")
        .expect("task");
    assert_eq!(view.task.retry, 1, "round 1 was the last round");
}

#[tokio::test]
async fn remote_batch_expiry_fails_chunk_and_rechunks_residual() {
    let mut remote = FakeRemote::new();
    remote.terminal_status = RemoteBatchStatus::Expired;
    let harness = harness(remote, test_config(0, 1000), ReconcilerOptions::default());
    let input = write_input(&harness, &[user_line("a")]);
    split(&harness, "t-expired", &input);

    let status = run_until_terminal(&harness, "t-expired", 20).await;
    assert_eq!(status, TaskStatus::ProcessCompleted);

    let view = harness
        .store
        .get_task_view("t-expired")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks[0].status, ChunkStatus::Failed);
    // No response and no fatal classification: the record stays residual.
    let residual = merged_lines(&harness, "t-expired", "missing_records_retry0.jsonl");
    assert_eq!(custom_ids(&residual), vec!["0"]);
    assert!(merged_lines(&harness, "t-expired", "output.jsonl").is_empty());
}

#[tokio::test]
async fn cancel_before_upload_drains_pending_chunks() {
    let harness = harness(
        FakeRemote::new(),
        test_config(1, 1),
        ReconcilerOptions::default(),
    );
    let input = write_input(&harness, &[user_line("a"), user_line("b")]);
    split(&harness, "t-cancel", &input);
    harness
        .store
        .update_task_status("t-cancel", TaskStatus::Stopping, None)
        .expect("request stop");

    let status = run_until_terminal(&harness, "t-cancel", 10).await;
    assert_eq!(status, TaskStatus::Canceled);

    let view = harness
        .store
        .get_task_view("t-cancel")
        .expect("view")
        .expect("task");
    assert!(view
        .chunks
        .iter()
        .all(|c| c.status == ChunkStatus::Canceled));
    assert_eq!(harness.remote.upload_count(), 0);
}

#[tokio::test]
async fn upload_failed_chunk_is_retried_even_while_stopping() {
    let remote = FakeRemote::new();
    remote.fail_uploads.store(true, Ordering::SeqCst);
    let harness = harness(remote, test_config(1, 1000), ReconcilerOptions::default());
    let input = write_input(&harness, &[user_line("a")]);
    split(&harness, "t-refused", &input);

    harness.reconciler.clone().sweep().await.expect("sweep 1");
    let view = harness
        .store
        .get_task_view("t-refused")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks[0].status, ChunkStatus::UploadFailed);
    assert_eq!(harness.remote.upload_count(), 1);

    harness
        .store
        .update_task_status("t-refused", TaskStatus::Stopping, None)
        .expect("request stop");

    // Stopping does not cancel an UploadFailed chunk; the upload is retried.
    harness.reconciler.clone().sweep().await.expect("sweep 2");
    let view = harness
        .store
        .get_task_view("t-refused")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks[0].status, ChunkStatus::UploadFailed);
    assert_eq!(harness.remote.upload_count(), 2);

    harness.remote.fail_uploads.store(false, Ordering::SeqCst);
    harness.reconciler.clone().sweep().await.expect("sweep 3");
    let view = harness
        .store
        .get_task_view("t-refused")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks[0].status, ChunkStatus::Uploaded);
    assert_eq!(harness.remote.upload_count(), 3);
}

#[tokio::test]
async fn cancel_timeout_force_cancels_processing_chunks() {
    let mut remote = FakeRemote::new();
    remote.polls_until_done = u32::MAX;
    let harness = harness(
        remote,
        test_config(1, 1000),
        ReconcilerOptions {
            cancel_timeout_ms: -1,
            ..Default::default()
        },
    );
    let input = write_input(&harness, &[user_line("a")]);
    split(&harness, "t-timeout", &input);

    // Two sweeps drive the chunk into Processing against the never-ending batch.
    harness.reconciler.clone().sweep().await.expect("sweep 1");
    harness.reconciler.clone().sweep().await.expect("sweep 2");
    let view = harness
        .store
        .get_task_view("t-timeout")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks[0].status, ChunkStatus::Processing);

    harness
        .store
        .update_task_status("t-timeout", TaskStatus::Stopping, None)
        .expect("request stop");
    let status = run_until_terminal(&harness, "t-timeout", 5).await;
    assert_eq!(status, TaskStatus::Canceled);

    let view = harness
        .store
        .get_task_view("t-timeout")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks[0].status, ChunkStatus::Canceled);
}

#[tokio::test]
async fn restart_resumes_from_uploaded_without_duplicate_upload() {
    let mut remote = FakeRemote::new();
    remote.polls_until_done = 0;
    let harness = harness(remote, test_config(1, 1000), ReconcilerOptions::default());
    let input = write_input(&harness, &[user_line("a")]);
    split(&harness, "t-restart", &input);

    // First sweep uploads; the daemon then "crashes".
    harness.reconciler.clone().sweep().await.expect("sweep");
    let view = harness
        .store
        .get_task_view("t-restart")
        .expect("view")
        .expect("task");
    assert_eq!(view.chunks[0].status, ChunkStatus::Uploaded);
    assert_eq!(harness.remote.upload_count(), 1);

    // A fresh reconciler over the same store picks up where it stopped.
    let revived = Arc::new(Reconciler::new(
        harness.store.clone(),
        harness.paths.clone(),
        harness.config.clone(),
        harness.remote.clone(),
        ReconcilerOptions::default(),
    ));
    for _ in 0..10 {
        revived.clone().sweep().await.expect("sweep");
        let task = harness
            .store
            .get_task("t-restart")
            .expect("get")
            .expect("task");
        if task.status.is_terminal() {
            break;
        }
    }

    assert_eq!(harness.remote.upload_count(), 1, "no duplicate upload");
    assert_eq!(harness.remote.create_count(), 1);
    let task = harness
        .store
        .get_task("t-restart")
        .expect("get")
        .expect("task");
    assert_eq!(task.status, TaskStatus::ProcessCompleted);
}

#[tokio::test]
async fn zombie_chunk_is_failed_before_any_merge() {
    let harness = harness(
        FakeRemote::new(),
        test_config(2, 1000),
        ReconcilerOptions::default(),
    );
    let input = write_input(&harness, &[user_line("a")]);
    split(&harness, "t-zombie", &input);

    // A rollover raced past this round: the task is already at retry 1 while
    // the round-0 chunk never went terminal.
    harness
        .store
        .update_task_retry("t-zombie", 1)
        .expect("advance retry");
    harness
        .store
        .update_task_status("t-zombie", TaskStatus::Processing, None)
        .expect("processing");

    harness.reconciler.clone().sweep().await.expect("sweep");

    let view = harness
        .store
        .get_task_view("t-zombie")
        .expect("view")
        .expect("task");
    let zombie = &view.chunks[0];
    assert_eq!(zombie.retry, 0);
    assert_eq!(zombie.status, ChunkStatus::Failed);
    assert_eq!(zombie.error_message.as_deref(), Some("zombie_chunk_reset"));
    // The merger was withheld: the task is still active.
    assert_eq!(view.task.status, TaskStatus::Processing);
    assert_eq!(harness.remote.upload_count(), 0);
}

#[tokio::test]
async fn split_completed_task_is_promoted_to_processing() {
    let mut remote = FakeRemote::new();
    remote.polls_until_done = u32::MAX;
    let harness = harness(remote, test_config(1, 1000), ReconcilerOptions::default());
    let input = write_input(&harness, &[user_line("a")]);
    split(&harness, "t-promote", &input);

    let task = harness
        .store
        .get_task("t-promote")
        .expect("get")
        .expect("task");
    assert_eq!(task.status, TaskStatus::SplitCompleted);

    harness.reconciler.clone().sweep().await.expect("sweep");
    let task = harness
        .store
        .get_task("t-promote")
        .expect("get")
        .expect("task");
    assert_eq!(task.status, TaskStatus::Processing);
}
