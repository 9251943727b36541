//! Input validation and chunking.
//!
//! Reads one JSONL input file, validates every line, reshapes valid lines
//! into remote request records, and flushes them into bounded chunk files
//! with one Pending chunk row each. The same chunk-writing rules re-chunk the
//! residual set at every retry rollover (validation skipped there; residual
//! lines are already in request shape).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AppConfig, ModelConfig, ValidationMode};
use crate::paths::{AppPaths, PathError};
use crate::store::{current_timestamp_ms, ChunkRecord, Store, StoreError, TaskRecord, TaskStatus};

const REQUEST_URL: &str = "/v1/chat/completions";
/// How many offending lines a strict-mode abort names in its error.
const REPORTED_FORMAT_ERRORS: usize = 5;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("input file does not exist: {path}")]
    InputMissing { path: PathBuf },
    #[error("task `{0}` already exists")]
    DuplicateTask(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read input file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "input failed validation with {count} format error(s); first: {first:?}; full log: {log}"
    )]
    FormatErrors {
        count: u64,
        first: Vec<String>,
        log: PathBuf,
    },
}

/// Outcome of a successful split.
#[derive(Debug, Clone)]
pub struct SplitReport {
    pub task_id: String,
    pub total_lines: u64,
    pub total_chunks: u32,
    pub error_count: u64,
    pub format_errors_path: Option<PathBuf>,
}

/// Generate a task id from the current time and a random suffix.
pub fn generate_task_id() -> String {
    let now_ms = current_timestamp_ms();
    let suffix: u32 = rand::thread_rng().gen();
    format!("task_{now_ms}_{suffix:08x}")
}

/// Split one input file into request chunks and persist the task.
pub fn split_file(
    store: &Store,
    paths: &AppPaths,
    config: &AppConfig,
    input_path: &Path,
    task_id: &str,
    lines_per_chunk: Option<usize>,
) -> Result<SplitReport, SplitError> {
    let metadata = fs::metadata(input_path).map_err(|_| SplitError::InputMissing {
        path: input_path.to_path_buf(),
    })?;
    if store.task_exists(task_id)? {
        return Err(SplitError::DuplicateTask(task_id.to_string()));
    }

    let lines_per_chunk = lines_per_chunk.unwrap_or(config.lines_per_chunk);
    debug_assert!(lines_per_chunk > 0);
    let original_filename = input_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("input.jsonl")
        .to_string();

    let task = TaskRecord::new(
        task_id,
        original_filename.clone(),
        input_path.to_string_lossy().into_owned(),
        metadata.len(),
        config.max_retry_count,
    );
    store.create_task(&task)?;
    info!(task_id = %task_id, file = %original_filename, lines_per_chunk, "split started");

    match scan_and_chunk(
        store,
        paths,
        config,
        input_path,
        task_id,
        &original_filename,
        lines_per_chunk,
    ) {
        Ok(report) => {
            store.update_task_totals(task_id, report.total_lines, u64::from(report.total_chunks))?;
            store.update_task_status(task_id, TaskStatus::SplitCompleted, None)?;
            info!(
                task_id = %task_id,
                total_lines = report.total_lines,
                total_chunks = report.total_chunks,
                format_errors = report.error_count,
                "split completed"
            );
            Ok(report)
        }
        Err(err) => {
            store.update_task_status(task_id, TaskStatus::Failed, Some(err.to_string()))?;
            Err(err)
        }
    }
}

fn scan_and_chunk(
    store: &Store,
    paths: &AppPaths,
    config: &AppConfig,
    input_path: &Path,
    task_id: &str,
    original_filename: &str,
    lines_per_chunk: usize,
) -> Result<SplitReport, SplitError> {
    let chunk_dir = paths.chunk_dir(task_id)?;
    let file = File::open(input_path).map_err(|source| SplitError::Read {
        path: input_path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);

    let mut errors = FormatErrorLog::new(paths, task_id);
    let mut current_lines: Vec<String> = Vec::new();
    let mut current_bytes: u64 = 0;
    let mut chunk_index: u32 = 0;
    let mut valid_count: u64 = 0;
    let mut line_no: u64 = 0;

    loop {
        let read = read_capped_line(&mut reader, config.max_line_bytes).map_err(|source| {
            SplitError::Read {
                path: input_path.to_path_buf(),
                source,
            }
        })?;
        line_no += 1;
        let raw = match read {
            CappedLine::Eof => break,
            CappedLine::Overlong => {
                errors.record(
                    line_no,
                    format!("line exceeds {} bytes", config.max_line_bytes),
                    "",
                )?;
                continue;
            }
            CappedLine::Line(bytes) => bytes,
        };
        let Ok(text) = String::from_utf8(raw) else {
            errors.record(line_no, "line is not valid UTF-8".to_string(), "")?;
            continue;
        };
        let line = text.trim();
        if line.is_empty() {
            continue;
        }

        let messages = match validate_line(line, &config.model.messages_key) {
            Ok(messages) => messages,
            Err(reason) => {
                errors.record(line_no, reason, line)?;
                continue;
            }
        };

        let request = build_request(&config.model, valid_count, messages);
        let encoded = request.to_string();
        let line_size = encoded.len() as u64 + 1;

        let over_lines = current_lines.len() + 1 > lines_per_chunk;
        let over_bytes = current_bytes + line_size > config.chunk_max_bytes;
        if (over_lines || over_bytes) && !current_lines.is_empty() {
            write_chunk(
                store,
                &chunk_dir,
                task_id,
                original_filename,
                0,
                chunk_index,
                &current_lines,
            )?;
            chunk_index += 1;
            current_lines.clear();
            current_bytes = 0;
        }

        current_lines.push(encoded);
        current_bytes += line_size;
        valid_count += 1;

        if config.test_lines > 0 && valid_count >= config.test_lines as u64 {
            info!(task_id = %task_id, limit = config.test_lines, "test line limit reached");
            break;
        }
    }

    if !current_lines.is_empty() {
        write_chunk(
            store,
            &chunk_dir,
            task_id,
            original_filename,
            0,
            chunk_index,
            &current_lines,
        )?;
        chunk_index += 1;
    }

    let (error_count, first_errors, log_path) = errors.finish()?;
    if config.validation == ValidationMode::Strict && error_count > 0 {
        // Strict mode keeps nothing: the partial chunk directory goes away and
        // the task fails with a pointer to the full error log.
        if let Err(err) = fs::remove_dir_all(&chunk_dir) {
            warn!(task_id = %task_id, error = %err, "failed to remove partial chunk directory");
        }
        return Err(SplitError::FormatErrors {
            count: error_count,
            first: first_errors,
            log: log_path.unwrap_or_default(),
        });
    }
    if error_count > 0 {
        warn!(
            task_id = %task_id,
            format_errors = error_count,
            log = %log_path.as_deref().unwrap_or(Path::new("")).display(),
            "format errors recorded; continuing with valid lines"
        );
    }

    Ok(SplitReport {
        task_id: task_id.to_string(),
        total_lines: valid_count,
        total_chunks: chunk_index,
        error_count,
        format_errors_path: log_path,
    })
}

/// Re-chunk residual request lines for the next retry round. The lines are
/// already in request shape, so no validation happens here.
pub(crate) fn write_residual_chunks(
    store: &Store,
    paths: &AppPaths,
    task: &TaskRecord,
    new_retry: u32,
    lines: &[String],
    lines_per_chunk: usize,
    chunk_max_bytes: u64,
) -> Result<u32, SplitError> {
    debug_assert!(new_retry > 0);
    debug_assert!(lines_per_chunk > 0);
    let chunk_dir = paths.chunk_dir(&task.task_id)?;

    let mut current: Vec<String> = Vec::new();
    let mut current_bytes: u64 = 0;
    let mut chunk_index: u32 = 0;
    for line in lines {
        let line_size = line.len() as u64 + 1;
        let over_lines = current.len() + 1 > lines_per_chunk;
        let over_bytes = current_bytes + line_size > chunk_max_bytes;
        if (over_lines || over_bytes) && !current.is_empty() {
            write_chunk(
                store,
                &chunk_dir,
                &task.task_id,
                &task.original_filename,
                new_retry,
                chunk_index,
                &current,
            )?;
            chunk_index += 1;
            current.clear();
            current_bytes = 0;
        }
        current.push(line.clone());
        current_bytes += line_size;
    }
    if !current.is_empty() {
        write_chunk(
            store,
            &chunk_dir,
            &task.task_id,
            &task.original_filename,
            new_retry,
            chunk_index,
            &current,
        )?;
        chunk_index += 1;
    }
    Ok(chunk_index)
}

fn write_chunk(
    store: &Store,
    chunk_dir: &Path,
    task_id: &str,
    original_filename: &str,
    retry: u32,
    chunk_index: u32,
    lines: &[String],
) -> Result<ChunkRecord, SplitError> {
    debug_assert!(!lines.is_empty());
    let filename = if retry > 0 {
        format!("retry{retry}_part{chunk_index}.{original_filename}")
    } else {
        format!("part{chunk_index}.{original_filename}")
    };
    let chunk_path = chunk_dir.join(filename);

    let mut data = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        data.push_str(line);
        data.push('\n');
    }
    fs::write(&chunk_path, &data).map_err(|source| SplitError::Io {
        path: chunk_path.clone(),
        source,
    })?;

    let chunk = ChunkRecord::new(
        task_id,
        chunk_index,
        retry,
        chunk_path.to_string_lossy().into_owned(),
        data.len() as u64,
    );
    store.add_chunk(&chunk)?;
    Ok(chunk)
}

/// Parse one input line and return its chat message array.
fn validate_line(line: &str, messages_key: &str) -> Result<JsonValue, String> {
    let parsed: JsonValue =
        serde_json::from_str(line).map_err(|_| "invalid JSON syntax".to_string())?;
    let object = parsed
        .as_object()
        .ok_or_else(|| "line is not a JSON object".to_string())?;
    let messages = object
        .get(messages_key)
        .ok_or_else(|| format!("missing or invalid field: {messages_key}"))?;
    let Some(array) = messages.as_array() else {
        return Err(format!("missing or invalid field: {messages_key}"));
    };
    for message in array {
        validate_message(message)?;
    }
    Ok(messages.clone())
}

fn validate_message(message: &JsonValue) -> Result<(), String> {
    let object = message
        .as_object()
        .ok_or_else(|| "message is not a JSON object".to_string())?;
    match object.get("role") {
        Some(role) if role.is_string() => {}
        _ => return Err("message missing string field `role`".to_string()),
    }
    match object.get("content") {
        Some(content) if content.is_string() || content.is_array() => Ok(()),
        _ => Err("message field `content` must be a string or array".to_string()),
    }
}

/// Build the remote request record for one valid input line. `custom_id` is
/// the 0-based index over valid lines and the join key with remote results.
fn build_request(model: &ModelConfig, custom_id: u64, messages: JsonValue) -> JsonValue {
    let mut body = JsonMap::new();
    body.insert("model".to_string(), JsonValue::String(model.domain.clone()));
    body.insert("messages".to_string(), messages);
    body.insert("max_tokens".to_string(), json!(model.max_tokens));
    if let Some(temperature) = model.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = model.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(enable_thinking) = model.enable_thinking {
        body.insert("enable_thinking".to_string(), json!(enable_thinking));
    }
    if let Some(extra) = &model.extra_body {
        for (key, value) in extra {
            body.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    json!({
        "custom_id": custom_id.to_string(),
        "method": "POST",
        "url": REQUEST_URL,
        "body": body,
    })
}

/// Lazily created `format_errors.jsonl` writer plus the first few messages
/// for the operator-facing abort error.
struct FormatErrorLog<'a> {
    paths: &'a AppPaths,
    task_id: &'a str,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    count: u64,
    first: Vec<String>,
}

impl<'a> FormatErrorLog<'a> {
    fn new(paths: &'a AppPaths, task_id: &'a str) -> Self {
        Self {
            paths,
            task_id,
            writer: None,
            path: None,
            count: 0,
            first: Vec::new(),
        }
    }

    fn record(&mut self, line_no: u64, error: String, content: &str) -> Result<(), SplitError> {
        self.count += 1;
        if self.first.len() < REPORTED_FORMAT_ERRORS {
            self.first.push(format!("line {line_no}: {error}"));
        }
        if self.writer.is_none() {
            let path = self.paths.format_errors_path(self.task_id)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)
                .map_err(|source| SplitError::Io {
                    path: path.clone(),
                    source,
                })?;
            self.writer = Some(BufWriter::new(file));
            self.path = Some(path);
        }
        let record = json!({"line_no": line_no, "error": error, "content": content});
        let writer = self.writer.as_mut().expect("writer initialized above");
        writeln!(writer, "{record}").map_err(|source| SplitError::Io {
            path: self.path.clone().unwrap_or_default(),
            source,
        })?;
        Ok(())
    }

    fn finish(mut self) -> Result<(u64, Vec<String>, Option<PathBuf>), SplitError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|source| SplitError::Io {
                path: self.path.clone().unwrap_or_default(),
                source,
            })?;
        }
        Ok((self.count, self.first, self.path))
    }
}

enum CappedLine {
    Line(Vec<u8>),
    Overlong,
    Eof,
}

/// Read one line with a hard byte cap. Overlong lines are consumed and
/// discarded so the scan can continue on the next line.
fn read_capped_line<R: BufRead>(reader: &mut R, cap: usize) -> io::Result<CappedLine> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(CappedLine::Eof);
            }
            return Ok(CappedLine::Line(buf));
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            if buf.len() + pos <= cap {
                buf.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                return Ok(CappedLine::Line(buf));
            }
            reader.consume(pos + 1);
            return Ok(CappedLine::Overlong);
        }
        let chunk_len = available.len();
        if buf.len() + chunk_len > cap {
            reader.consume(chunk_len);
            skip_to_newline(reader)?;
            return Ok(CappedLine::Overlong);
        }
        buf.extend_from_slice(available);
        reader.consume(chunk_len);
    }
}

fn skip_to_newline<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let chunk_len = available.len();
        reader.consume(chunk_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_CHUNK_BYTES, MAX_LINE_BYTES, MAX_LINES_PER_CHUNK};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn test_config() -> AppConfig {
        AppConfig {
            model: ModelConfig {
                domain: "spark-pro".to_string(),
                max_tokens: 1024,
                messages_key: "messages".to_string(),
                password: "secret".to_string(),
                base_url: "https://example.com".to_string(),
                temperature: None,
                top_p: None,
                enable_thinking: None,
                extra_body: None,
            },
            test_lines: -1,
            max_retry_count: 1,
            lines_per_chunk: MAX_LINES_PER_CHUNK,
            validation: ValidationMode::Lenient,
            base_dir: None,
            chunk_max_bytes: MAX_CHUNK_BYTES,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    fn fixture(lines: &[&str]) -> (TempDir, AppPaths, Store, PathBuf) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path().join("base")).expect("paths");
        let store = Store::open(&paths).expect("store");
        let input = temp.path().join("input.jsonl");
        fs::write(&input, lines.join("\n")).expect("write input");
        (temp, paths, store, input)
    }

    fn user_line(content: &str) -> String {
        json!({"messages": [{"role": "user", "content": content}]}).to_string()
    }

    #[test]
    fn split_assigns_sequential_custom_ids() {
        let lines = [user_line("a"), user_line("b")];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let mut config = test_config();
        config.lines_per_chunk = 1;

        let report =
            split_file(&store, &paths, &config, &input, "t-ids", None).expect("split succeeds");
        assert_eq!(report.total_lines, 2);
        assert_eq!(report.total_chunks, 2);
        assert_eq!(report.error_count, 0);

        let view = store.get_task_view("t-ids").expect("view").expect("task");
        assert_eq!(view.task.status, TaskStatus::SplitCompleted);
        assert_eq!(view.task.total_lines, 2);
        assert_eq!(view.task.total_chunks, 2);
        assert_eq!(view.chunks.len(), 2);

        let first = fs::read_to_string(&view.chunks[0].chunk_path).expect("chunk 0");
        let record: JsonValue = serde_json::from_str(first.trim()).expect("json");
        assert_eq!(record["custom_id"], "0");
        assert_eq!(record["method"], "POST");
        assert_eq!(record["url"], REQUEST_URL);
        assert_eq!(record["body"]["model"], "spark-pro");
        assert_eq!(record["body"]["max_tokens"], 1024);

        let second = fs::read_to_string(&view.chunks[1].chunk_path).expect("chunk 1");
        let record: JsonValue = serde_json::from_str(second.trim()).expect("json");
        assert_eq!(record["custom_id"], "1");
    }

    #[test]
    fn lenient_mode_records_format_errors_and_continues() {
        let lines = [user_line("a"), user_line("b"), "not json".to_string()];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let config = test_config();

        let report =
            split_file(&store, &paths, &config, &input, "t-lenient", None).expect("split succeeds");
        assert_eq!(report.total_lines, 2);
        assert_eq!(report.error_count, 1);

        let log = report.format_errors_path.expect("error log");
        let contents = fs::read_to_string(log).expect("read log");
        let record: JsonValue = serde_json::from_str(contents.trim()).expect("json");
        assert_eq!(record["line_no"], 3);
        assert_eq!(record["error"], "invalid JSON syntax");
        assert_eq!(record["content"], "not json");
    }

    #[test]
    fn strict_mode_aborts_and_removes_partial_chunks() {
        let lines = [user_line("a"), "garbage".to_string()];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let mut config = test_config();
        config.validation = ValidationMode::Strict;

        let err = split_file(&store, &paths, &config, &input, "t-strict", None)
            .expect_err("must abort");
        match err {
            SplitError::FormatErrors { count, first, .. } => {
                assert_eq!(count, 1);
                assert_eq!(first.len(), 1);
                assert!(first[0].contains("line 2"));
            }
            other => panic!("expected format errors, got {other:?}"),
        }

        let task = store.get_task("t-strict").expect("get").expect("task row");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!paths.base_dir().join("chunks/t-strict").exists());
    }

    #[test]
    fn missing_messages_key_is_a_format_error() {
        let lines = [json!({"prompt": "hi"}).to_string(), user_line("ok")];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let config = test_config();

        let report =
            split_file(&store, &paths, &config, &input, "t-key", None).expect("split succeeds");
        assert_eq!(report.total_lines, 1);
        assert_eq!(report.error_count, 1);
    }

    #[test]
    fn message_shape_is_validated() {
        let bad_role = json!({"messages": [{"content": "hi"}]}).to_string();
        let bad_content = json!({"messages": [{"role": "user", "content": 7}]}).to_string();
        let lines = [bad_role, bad_content, user_line("ok")];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let config = test_config();

        let report =
            split_file(&store, &paths, &config, &input, "t-msg", None).expect("split succeeds");
        assert_eq!(report.total_lines, 1);
        assert_eq!(report.error_count, 2);
    }

    #[test]
    fn byte_cap_flushes_before_line_cap() {
        let lines = [user_line("aaaa"), user_line("bbbb"), user_line("cccc")];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let mut config = test_config();
        // Roomy enough for one request record but never two.
        config.chunk_max_bytes = 200;

        let report =
            split_file(&store, &paths, &config, &input, "t-bytes", None).expect("split succeeds");
        assert_eq!(report.total_lines, 3);
        assert_eq!(report.total_chunks, 3);
    }

    #[test]
    fn test_lines_truncates_valid_records() {
        let lines = [user_line("a"), user_line("b"), user_line("c")];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let mut config = test_config();
        config.test_lines = 2;

        let report =
            split_file(&store, &paths, &config, &input, "t-test", None).expect("split succeeds");
        assert_eq!(report.total_lines, 2);
    }

    #[test]
    fn duplicate_task_id_is_refused() {
        let lines = [user_line("a")];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_temp, paths, store, input) = fixture(&refs);
        let config = test_config();

        split_file(&store, &paths, &config, &input, "t-dup", None).expect("first split");
        let err =
            split_file(&store, &paths, &config, &input, "t-dup", None).expect_err("second split");
        assert!(matches!(err, SplitError::DuplicateTask(id) if id == "t-dup"));
    }

    #[test]
    fn missing_input_is_refused_before_creating_the_task() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path().join("base")).expect("paths");
        let store = Store::open(&paths).expect("store");
        let config = test_config();

        let err = split_file(
            &store,
            &paths,
            &config,
            &temp.path().join("absent.jsonl"),
            "t-missing",
            None,
        )
        .expect_err("must refuse");
        assert!(matches!(err, SplitError::InputMissing { .. }));
        assert!(!store.task_exists("t-missing").expect("exists"));
    }

    #[test]
    fn optional_model_fields_and_extra_body_are_merged() {
        let mut model = test_config().model;
        model.temperature = Some(0.5);
        model.top_p = Some(0.9);
        model.enable_thinking = Some(false);
        let mut extra = JsonMap::new();
        extra.insert("seed".to_string(), json!(42));
        extra.insert("model".to_string(), json!("never-wins"));
        model.extra_body = Some(extra);

        let request = build_request(&model, 7, json!([{"role": "user", "content": "x"}]));
        assert_eq!(request["custom_id"], "7");
        assert_eq!(request["body"]["temperature"], 0.5);
        assert_eq!(request["body"]["top_p"], 0.9);
        assert_eq!(request["body"]["enable_thinking"], false);
        assert_eq!(request["body"]["seed"], 42);
        // Core keys win over extra_body collisions.
        assert_eq!(request["body"]["model"], "spark-pro");
    }

    #[test]
    fn overlong_line_is_discarded_and_scan_continues() {
        let long = "x".repeat(64);
        let mut reader = Cursor::new(format!("{long}\nshort\n"));
        match read_capped_line(&mut reader, 16).expect("read") {
            CappedLine::Overlong => {}
            other => panic!("expected overlong, got {:?}", discriminant_name(&other)),
        }
        match read_capped_line(&mut reader, 16).expect("read") {
            CappedLine::Line(bytes) => assert_eq!(bytes, b"short"),
            other => panic!("expected line, got {:?}", discriminant_name(&other)),
        }
        assert!(matches!(
            read_capped_line(&mut reader, 16).expect("read"),
            CappedLine::Eof
        ));
    }

    fn discriminant_name(line: &CappedLine) -> &'static str {
        match line {
            CappedLine::Line(_) => "Line",
            CappedLine::Overlong => "Overlong",
            CappedLine::Eof => "Eof",
        }
    }

    #[test]
    fn residual_rechunk_honours_line_cap() {
        let (_temp, paths, store, _input) = fixture(&[]);
        let task = TaskRecord::new("t-resid", "input.jsonl", "/tmp/in", 1, 1);
        store.create_task(&task).expect("create");

        let lines: Vec<String> = (0..5)
            .map(|i| json!({"custom_id": i.to_string()}).to_string())
            .collect();
        let created = write_residual_chunks(
            &store,
            &paths,
            &task,
            1,
            &lines,
            2,
            MAX_CHUNK_BYTES,
        )
        .expect("rechunk");
        assert_eq!(created, 3);

        let view = store.get_task_view("t-resid").expect("view").expect("task");
        assert!(view
            .chunks
            .iter()
            .all(|c| c.retry == 1 && c.chunk_id.contains("_retry1_chunk_")));
        let first = fs::read_to_string(&view.chunks[0].chunk_path).expect("chunk file");
        assert_eq!(first.lines().count(), 2);
        assert!(view.chunks[0]
            .chunk_path
            .ends_with("retry1_part0.input.jsonl"));
    }

    #[test]
    fn generated_task_ids_are_unique_enough() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert!(a.starts_with("task_"));
        assert_ne!(a, b);
    }
}
