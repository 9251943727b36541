//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

/// Hard ceiling on request lines per chunk; the remote rejects larger uploads.
pub const MAX_LINES_PER_CHUNK: usize = 50_000;
/// Hard ceiling on the accumulated byte size of one chunk file.
pub const MAX_CHUNK_BYTES: u64 = 100 * 1024 * 1024;
/// Hard ceiling on one input line; longer lines are format errors.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

const ENV_PREFIX: &str = "BATCHLINE";
const DEFAULT_BASE_URL: &str = "https://spark-api-open.xf-yun.com";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

/// Fully resolved application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub model: ModelConfig,
    /// Stop splitting after this many valid records; -1 disables truncation.
    pub test_lines: i64,
    /// Highest retry round; 0 means round 0 is the only round.
    pub max_retry_count: u32,
    pub lines_per_chunk: usize,
    pub validation: ValidationMode,
    /// Root of the on-disk layout. Falls back to the platform data dir.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    pub chunk_max_bytes: u64,
    pub max_line_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Remote model identifier placed into the request `body.model`.
    pub domain: String,
    pub max_tokens: u32,
    /// Field in each input line holding the chat message array.
    pub messages_key: String,
    /// Bearer token for the remote batch API.
    pub password: String,
    pub base_url: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub enable_thinking: Option<bool>,
    /// Extra key/value pairs merged into every request body.
    #[serde(default)]
    pub extra_body: Option<JsonMap<String, JsonValue>>,
}

/// What to do with input lines that fail format validation.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Abort the split on the first batch of format errors.
    Strict,
    /// Record format errors and continue with the valid lines.
    Lenient,
}

pub fn load(path: &Path) -> Result<AppConfig, AppConfigError> {
    let builder = Config::builder()
        .set_default("test_lines", -1)?
        .set_default("max_retry_count", 0)?
        .set_default("lines_per_chunk", MAX_LINES_PER_CHUNK as i64)?
        .set_default("validation", "lenient")?
        .set_default("chunk_max_bytes", MAX_CHUNK_BYTES as i64)?
        .set_default("max_line_bytes", MAX_LINE_BYTES as i64)?
        .set_default("model.base_url", DEFAULT_BASE_URL)?
        .add_source(
            File::from(path.to_path_buf())
                .format(FileFormat::Yaml)
                .required(true),
        )
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &AppConfig) -> Result<(), AppConfigError> {
    if cfg.model.domain.trim().is_empty() {
        return Err(invalid("model.domain must not be empty"));
    }
    if cfg.model.messages_key.trim().is_empty() {
        return Err(invalid("model.messages_key must not be empty"));
    }
    if cfg.model.password.trim().is_empty() {
        return Err(invalid("model.password must not be empty"));
    }
    if cfg.model.max_tokens == 0 {
        return Err(invalid("model.max_tokens must be greater than zero"));
    }
    if cfg.model.base_url.trim().is_empty() {
        return Err(invalid("model.base_url must not be empty"));
    }
    if cfg.lines_per_chunk == 0 || cfg.lines_per_chunk > MAX_LINES_PER_CHUNK {
        return Err(invalid(format!(
            "lines_per_chunk must be between 1 and {MAX_LINES_PER_CHUNK}"
        )));
    }
    if cfg.chunk_max_bytes == 0 || cfg.chunk_max_bytes > MAX_CHUNK_BYTES {
        return Err(invalid(format!(
            "chunk_max_bytes must be between 1 and {MAX_CHUNK_BYTES}"
        )));
    }
    if cfg.max_line_bytes == 0 || cfg.max_line_bytes > MAX_LINE_BYTES {
        return Err(invalid(format!(
            "max_line_bytes must be between 1 and {MAX_LINE_BYTES}"
        )));
    }
    if cfg.test_lines < -1 {
        return Err(invalid("test_lines must be -1 or a non-negative count"));
    }
    Ok(())
}

fn invalid<S: Into<String>>(message: S) -> AppConfigError {
    AppConfigError::Build(config::ConfigError::Message(message.into()))
}
