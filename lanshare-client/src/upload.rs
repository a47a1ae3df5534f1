//! Multipart uploads with progress reporting and a hard deadline.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, stream};
use lanshare_core::FileRecord;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    api::FileService,
    error::UploadError,
    notify::{Notice, Notifier},
};

/// Receives whole percentages, strictly increasing, for one upload.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

const BYTES_CHUNK: usize = 64 * 1024;

pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    filename: Option<String>,
    original_name: Option<String>,
    size: Option<u64>,
    uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

struct ProgressTracker {
    total: u64,
    sent: AtomicU64,
    last: AtomicU8,
    report: ProgressFn,
}

impl ProgressTracker {
    fn new(total: u64, report: ProgressFn) -> Self {
        Self {
            total,
            sent: AtomicU64::new(0),
            last: AtomicU8::new(0),
            report,
        }
    }

    fn advance(&self, bytes: usize) {
        let sent = self.sent.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        let percent = if self.total == 0 {
            100
        } else {
            (sent.min(self.total) * 100 / self.total) as u8
        };
        self.publish(percent);
    }

    fn publish(&self, percent: u8) {
        let previous = self.last.fetch_max(percent, Ordering::Relaxed);
        if percent > previous {
            (self.report)(percent);
        }
    }
}

pub async fn upload_path(
    http: &reqwest::Client,
    endpoint: Url,
    path: &Path,
    timeout: Duration,
    progress: ProgressFn,
) -> Result<FileRecord, UploadError> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let name = display_name(path);
    let mime = mime_guess::from_path(path)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_owned());

    send_upload(
        http,
        endpoint,
        ReaderStream::new(file),
        len,
        &name,
        &mime,
        timeout,
        progress,
    )
    .await
}

pub async fn upload_bytes(
    http: &reqwest::Client,
    endpoint: Url,
    bytes: Bytes,
    filename_hint: &str,
    timeout: Duration,
    progress: ProgressFn,
) -> Result<FileRecord, UploadError> {
    let len = bytes.len() as u64;
    let chunks: Vec<io::Result<Bytes>> = bytes
        .chunks(BYTES_CHUNK)
        .map(|chunk| Ok(bytes.slice_ref(chunk)))
        .collect();
    let mime = mime_guess::from_path(filename_hint)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_owned());

    send_upload(
        http,
        endpoint,
        stream::iter(chunks),
        len,
        filename_hint,
        &mime,
        timeout,
        progress,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn send_upload<S>(
    http: &reqwest::Client,
    endpoint: Url,
    body: S,
    len: u64,
    name: &str,
    mime: &str,
    timeout: Duration,
    progress: ProgressFn,
) -> Result<FileRecord, UploadError>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
{
    let tracker = Arc::new(ProgressTracker::new(len, progress));
    let counted = {
        let tracker = Arc::clone(&tracker);
        body.map(move |chunk| {
            if let Ok(bytes) = &chunk {
                tracker.advance(bytes.len());
            }
            chunk
        })
    };

    let part = Part::stream_with_length(reqwest::Body::wrap_stream(counted), len)
        .file_name(name.to_owned())
        .mime_str(mime)
        .map_err(UploadError::Network)?;
    let form = Form::new().part("file", part);

    let request = async {
        let response = http
            .post(endpoint)
            .header("X-Requested-With", "XMLHttpRequest")
            .multipart(form)
            .send()
            .await
            .map_err(UploadError::Network)?;
        parse_response(response).await
    };

    let record = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| UploadError::Timeout(timeout))??;
    if len == 0 {
        tracker.publish(100);
    }
    Ok(record)
}

async fn parse_response(response: reqwest::Response) -> Result<FileRecord, UploadError> {
    let status = response.status();
    let body = response.text().await.map_err(UploadError::Network)?;

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .ok()
            .and_then(|parsed| parsed.error)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_owned());
        return Err(UploadError::Status {
            status: status.as_u16(),
            message,
        });
    }

    let parsed: UploadResponse =
        serde_json::from_str(&body).map_err(|err| UploadError::Parse(err.to_string()))?;
    if !parsed.success {
        return Err(UploadError::Server(
            parsed.error.unwrap_or_else(|| "upload failed".to_owned()),
        ));
    }

    match (
        parsed.filename,
        parsed.original_name,
        parsed.size,
        parsed.uploaded_at,
    ) {
        (Some(filename), Some(original_name), Some(size), Some(uploaded_at)) => Ok(FileRecord {
            filename,
            original_name,
            size,
            uploaded_at,
            url: parsed.url,
        }),
        _ => Err(UploadError::Parse("response is missing file metadata".to_owned())),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub path: PathBuf,
    pub result: Result<FileRecord, String>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Uploads `paths` one after another. A failed file never stops the batch.
pub async fn upload_batch<S, N>(
    service: &S,
    paths: &[PathBuf],
    delay: Duration,
    notifier: &Arc<N>,
) -> Vec<UploadOutcome>
where
    S: FileService,
    N: Notifier,
{
    let mut outcomes = Vec::with_capacity(paths.len());
    for (index, path) in paths.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(delay).await;
        }

        let name = display_name(path);
        notifier.notify(Notice::Uploading { name: name.clone() });
        let progress: ProgressFn = {
            let notifier = Arc::clone(notifier);
            let name = name.clone();
            Arc::new(move |percent: u8| {
                notifier.notify(Notice::UploadProgress {
                    name: name.clone(),
                    percent,
                });
            })
        };

        let result = match service.upload_file(path, progress).await {
            Ok(record) => {
                info!(filename = %record.filename, size = record.size, "upload complete");
                notifier.notify(Notice::UploadComplete { name: name.clone() });
                Ok(record)
            }
            Err(err) => {
                warn!(path = %path.display(), "upload failed: {err}");
                let reason = err.to_string();
                notifier.notify(Notice::UploadFailed {
                    name: name.clone(),
                    reason: reason.clone(),
                });
                Err(reason)
            }
        };
        outcomes.push(UploadOutcome {
            path: path.clone(),
            result,
        });
    }

    debug!(
        total = outcomes.len(),
        failed = outcomes.iter().filter(|o| !o.is_success()).count(),
        "upload batch finished"
    );
    outcomes
}
