//! Typed error hierarchy for the cb-lr crate.
//!
//! `CbError` covers every failure boundary a caller can observe:
//! - the REST layer (`ObjectNotFound`, `Unauthorized`, `Server`, `Network`,
//!   `Parse`),
//! - the live response command protocol (`UnsupportedCommand`,
//!   `LiveResponse`, `SubmitRetriesExhausted`, `Timeout`, `SessionTimeout`),
//! - the job scheduler (`WorkerUnavailable`, `JobAbandoned`, `JobPanicked`,
//!   `Shutdown`).
//!
//! The two timeout kinds are separate variants: `SubmitRetriesExhausted` is
//! raised when the session kept disappearing while a command was being
//! submitted, `Timeout` when a submitted command never reached a terminal
//! status.

use reqwest::StatusCode;
use std::time::Duration;

use crate::result_code::decode_result_code;

/// Unified error type for all cb-lr library operations.
#[derive(Debug, thiserror::Error)]
pub enum CbError {
    /// The command name is not in the session's advertised capability list.
    /// Raised before any HTTP request is made and never retried.
    #[error("command '{command}' is not supported by session {session_id}")]
    UnsupportedCommand {
        /// The rejected command name (e.g. `"memdump"`).
        command: String,
        /// The session that rejected it.
        session_id: String,
    },

    /// The server reported status `error` for a polled command.
    #[error(transparent)]
    LiveResponse(#[from] LiveResponseError),

    /// The session kept disappearing while a command was being submitted and
    /// the retry budget ran out.
    #[error("timed out submitting '{command}' to {uri} after {attempts} attempts")]
    SubmitRetriesExhausted {
        /// The command that could not be submitted.
        command: String,
        /// Number of submission attempts made.
        attempts: u32,
        /// The last command URL that was attempted.
        uri: String,
    },

    /// A polled resource never reached a terminal status before the
    /// configured timeout.
    #[error("timed out after {elapsed:?} polling {uri}")]
    Timeout {
        /// The polled URL.
        uri: String,
        /// Elapsed time when the timeout was detected.
        elapsed: Duration,
    },

    /// A new live response session did not become active in time.
    #[error("session for endpoint {endpoint_id} did not become active within {elapsed:?}")]
    SessionTimeout {
        /// The endpoint the session was requested for.
        endpoint_id: String,
        /// Elapsed time when the attempt was abandoned.
        elapsed: Duration,
    },

    /// 404 from the REST API.
    #[error("object not found at {uri}: {body}")]
    ObjectNotFound {
        /// The requested URL.
        uri: String,
        /// Raw response body.
        body: String,
    },

    /// 401 from the REST API. The API token is static, so this is never
    /// retried.
    #[error("unauthorized request to {uri}: {body}")]
    Unauthorized {
        /// The requested URL.
        uri: String,
        /// Raw response body.
        body: String,
    },

    /// Any other non-success HTTP status.
    #[error("server error {status} from {uri}: {body}")]
    Server {
        /// The HTTP status returned.
        status: StatusCode,
        /// The requested URL.
        uri: String,
        /// Raw response body, kept for diagnostics.
        body: String,
    },

    /// Transport-level failure (DNS, TCP, TLS, request timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON deserialization failed.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Local filesystem failure (e.g. writing a downloaded memory dump).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration file or value.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },

    /// No worker could be established for the endpoint, so its queued jobs
    /// were failed.
    #[error("no worker available for endpoint {endpoint_id}: {reason}")]
    WorkerUnavailable {
        /// The endpoint whose jobs were failed.
        endpoint_id: String,
        /// The last session establishment error.
        reason: String,
    },

    /// The work item was dropped before any result was produced.
    #[error("job for endpoint {endpoint_id} was dropped before completion")]
    JobAbandoned {
        /// The endpoint the job targeted.
        endpoint_id: String,
    },

    /// The job panicked while running on its worker.
    #[error("job for endpoint {endpoint_id} panicked")]
    JobPanicked {
        /// The endpoint the job targeted.
        endpoint_id: String,
    },

    /// The manager was shut down before the job was dispatched.
    #[error("live response manager is shut down")]
    Shutdown,
}

impl CbError {
    /// Returns `true` when the error means the session itself is gone
    /// (expired, closed server-side, or never existed), as opposed to a
    /// failure of the command that was being sent.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, CbError::ObjectNotFound { .. })
    }

    /// Returns `true` for the timeout family of errors.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CbError::Timeout { .. }
                | CbError::SubmitRetriesExhausted { .. }
                | CbError::SessionTimeout { .. }
        )
    }
}

/// Structured failure reported by the server for a live response command.
///
/// `decoded` holds the human-readable form of `result_code` when the code is
/// one we know, or `"unknown error code"` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("live response command '{command}' failed: {decoded} (result code {result_code:#x}, {result_type})")]
pub struct LiveResponseError {
    /// The command name.
    pub command: String,
    /// Raw vendor result code.
    pub result_code: u64,
    /// Result code namespace, e.g. `"WinHresult"`.
    pub result_type: String,
    /// Free-form description from the server, if any.
    pub result_desc: String,
    /// Decoded reason.
    pub decoded: String,
}

impl LiveResponseError {
    /// Builds the error from the raw fields of a command status.
    pub fn new(command: &str, result_code: u64, result_type: &str, result_desc: &str) -> Self {
        let decoded = decode_result_code(result_type, result_code)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                if result_desc.is_empty() {
                    "unknown error code".to_string()
                } else {
                    result_desc.to_string()
                }
            });
        LiveResponseError {
            command: command.to_string(),
            result_code,
            result_type: result_type.to_string(),
            result_desc: result_desc.to_string(),
            decoded,
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, CbError>;
