use std::time::Duration;

use lanshare_core::CoreError;
use thiserror::Error;

/// Upload failures, kept distinct for logging; users see them uniformly.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("network error during upload: {0}")]
    Network(#[source] reqwest::Error),
    #[error("server rejected upload: {0}")]
    Server(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to parse server response: {0}")]
    Parse(String),
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to read upload source: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("failed to load {what}: {reason}")]
    Fetch { what: &'static str, reason: String },
    #[error("failed to delete {filename}: {reason}")]
    Delete { filename: String, reason: String },
    #[error("download failed: {0}")]
    Download(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ClientError {
    pub fn fetch(what: &'static str, reason: impl ToString) -> Self {
        ClientError::Fetch {
            what,
            reason: reason.to_string(),
        }
    }

    pub fn delete(filename: &str, reason: impl ToString) -> Self {
        ClientError::Delete {
            filename: filename.to_owned(),
            reason: reason.to_string(),
        }
    }
}
