//! Error taxonomy for the backend supervisor and the segmentation client.
//!
//! Setup failures end a start attempt, transport failures come from the HTTP layer, and
//! protocol failures abort parsing of a whole response.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures that end the current backend start attempt.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("bundled backend resources not found at {0}")]
    BundleMissing(PathBuf),

    #[error("failed to extract backend bundle into {target}: {reason}")]
    Extraction { target: PathBuf, reason: String },

    #[error("timed out after {0:?} waiting for another extraction to finish")]
    LockTimeout(Duration),

    #[error("bundled Python runtime not found in {0}")]
    RuntimeNotFound(PathBuf),

    #[error("missing entry script {0}")]
    EntryScriptMissing(PathBuf),

    #[error("could not allocate a local port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("failed to launch backend process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("backend did not become ready in time{}{}", fmt_last_error(.last_error), fmt_tail(.output_tail))]
    NotReady {
        last_error: Option<String>,
        output_tail: Vec<String>,
    },
}

fn fmt_last_error(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last probe error: {e})"),
        None => String::new(),
    }
}

fn fmt_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        return String::new();
    }
    format!("\nlast backend output:\n  {}", tail.join("\n  "))
}

/// Connection-level failures talking to the backend.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("could not parse endpoint {0}")]
    Endpoint(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// The backend answered, but not with something usable.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Non-2xx reply. The body is a human-readable diagnostic and is the whole message.
    #[error("{body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("response line {line}: {source}")]
    MalformedLine {
        line: usize,
        #[source]
        source: GeometryError,
    },

    #[error("response line {line} is not valid UTF-8")]
    InvalidEncoding { line: usize },

    #[error("unexpected model catalog payload: {0}")]
    Catalog(#[from] serde_json::Error),
}

/// Raised while turning one coordinate line into a cell.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),

    #[error("invalid scale factor {0}; must be greater than zero")]
    InvalidScale(f64),
}

/// Everything `segment()` can fail with.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("failed to prepare image {path}: {reason}")]
    Image { path: PathBuf, reason: String },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(TransportError::Http(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_message_is_the_body() {
        let e = ProtocolError::Status {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "Server Error: Model misconfigured.".into(),
        };
        assert_eq!(e.to_string(), "Server Error: Model misconfigured.");
    }

    #[test]
    fn not_ready_carries_last_probe_error_and_tail() {
        let e = SetupError::NotReady {
            last_error: Some("connection refused".into()),
            output_tail: vec!["[stderr] Traceback".into()],
        };
        let msg = e.to_string();
        assert!(msg.starts_with("backend did not become ready in time"));
        assert!(msg.contains("connection refused"));
        assert!(msg.contains("[stderr] Traceback"));
    }

    #[test]
    fn not_ready_without_context() {
        let e = SetupError::NotReady {
            last_error: None,
            output_tail: Vec::new(),
        };
        assert_eq!(e.to_string(), "backend did not become ready in time");
    }
}
