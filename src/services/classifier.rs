//! Pure classification of remote result records.
//!
//! Partitions every record of a retry round into succeeded, fatal, or
//! retryable. The remote mixes HTTP status codes with an embedded business
//! code, and occasionally files a fully successful record in the error file;
//! both signals are normalized here so the merger can stay mechanical.

use std::collections::HashSet;

use serde::Deserialize;

/// Business error codes that are never worth retrying.
const FATAL_ERROR_CODES: [&str; 9] = [
    "context_length_exceeded",
    "invalid_request_error",
    "invalid_api_key",
    "unknown_url",
    "string_above_128k_tokens",
    "model_not_found",
    "10003",
    "invalid_role",
    "INVALID_PAYLOAD",
];

/// One failed record, kept for the operator-facing failure analysis report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub custom_id: String,
    pub status_code: u16,
    pub error_code: String,
    pub error_message: String,
    pub fatal: bool,
}

/// How one result line was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDisposition {
    /// The record is a genuine response; its line belongs in the merged output.
    Success,
    /// The record failed; details were appended to the failure report.
    Failure,
    /// The record succeeded earlier in this round; the line is a duplicate.
    DuplicateSuccess,
    /// The line could not be parsed as a result record.
    Unparseable,
}

/// Accumulated classification of one retry round.
#[derive(Debug, Default)]
pub struct RoundClassification {
    pub succeeded: HashSet<String>,
    pub fatal: HashSet<String>,
    pub failures: Vec<FailureRecord>,
}

impl RoundClassification {
    /// Absorb one line of a remote output file.
    pub fn absorb_output_line(&mut self, line: &str) -> LineDisposition {
        self.absorb(line)
    }

    /// Absorb one line of a remote error file. A record matching the success
    /// rule here is the remote's "false success" and is treated as succeeded.
    pub fn absorb_error_line(&mut self, line: &str) -> LineDisposition {
        self.absorb(line)
    }

    /// A record is residual when it neither succeeded nor failed fatally.
    pub fn is_residual(&self, custom_id: &str) -> bool {
        !self.succeeded.contains(custom_id) && !self.fatal.contains(custom_id)
    }

    fn absorb(&mut self, line: &str) -> LineDisposition {
        let Ok(record) = serde_json::from_str::<ResultRecord>(line) else {
            return LineDisposition::Unparseable;
        };
        if record.custom_id.is_empty() {
            return LineDisposition::Unparseable;
        }

        let status = record.response.status_code;
        let code = record.response.body.business_code();

        if (200..300).contains(&status) && code == 0 {
            if self.succeeded.insert(record.custom_id) {
                return LineDisposition::Success;
            }
            return LineDisposition::DuplicateSuccess;
        }

        self.record_failure(record);
        LineDisposition::Failure
    }

    fn record_failure(&mut self, record: ResultRecord) {
        let status = record.response.status_code;

        // status_code 0 means the remote refused to parse the payload at all;
        // there is nothing to retry.
        if status == 0 {
            self.fatal.insert(record.custom_id.clone());
            self.failures.push(FailureRecord {
                custom_id: record.custom_id,
                status_code: 400,
                error_code: "INVALID_PAYLOAD".to_string(),
                error_message: "remote refused to parse the request payload".to_string(),
                fatal: true,
            });
            return;
        }

        let (error_code, error_message) = record.response.body.error_details();
        let fatal = is_fatal(status, &error_code);
        if fatal {
            self.fatal.insert(record.custom_id.clone());
        }
        self.failures.push(FailureRecord {
            custom_id: record.custom_id,
            status_code: status,
            error_code,
            error_message,
            fatal,
        });
    }
}

/// Whether a failure is beyond retrying: any HTTP 4xx except 429, or a
/// business code from the fixed fatal set.
pub fn is_fatal(status_code: u16, error_code: &str) -> bool {
    if (400..500).contains(&status_code) && status_code != 429 {
        return true;
    }
    FATAL_ERROR_CODES.contains(&error_code)
}

#[derive(Debug, Deserialize)]
struct ResultRecord {
    custom_id: String,
    #[serde(default)]
    response: ResponseEnvelope,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    body: ResponseBody,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    code: Option<BusinessCode>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

impl ResponseBody {
    /// Normalized business code; missing or non-numeric counts as 0.
    fn business_code(&self) -> i64 {
        match &self.code {
            Some(BusinessCode::Int(value)) => *value,
            Some(BusinessCode::Text(text)) => text.trim().parse().unwrap_or(0),
            None => 0,
        }
    }

    /// Error code and message, preferring the structured `error` object and
    /// falling back to a non-zero business code with the top-level message.
    fn error_details(&self) -> (String, String) {
        if let Some(detail) = &self.error {
            let code = detail.code.clone().unwrap_or_default();
            let message = detail.message.clone().unwrap_or_default();
            if !code.is_empty() || !message.is_empty() {
                return (code, message);
            }
        }
        let code = self.business_code();
        if code != 0 {
            return (code.to_string(), self.message.clone().unwrap_or_default());
        }
        (String::new(), self.message.clone().unwrap_or_default())
    }
}

/// The remote emits the business code as an integer or a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BusinessCode {
    Int(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}
