//! HTTP side of the client: snapshot reads, deletes, downloads and uploads.

use std::{future::Future, path::Path, sync::Arc};

use bytes::Bytes;
use lanshare_core::{FileRecord, Message};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::{
    config::ClientConfig,
    error::ClientError,
    upload::{self, ProgressFn},
};

/// Server operations the synchronizer depends on.
pub trait FileService: Send + Sync + 'static {
    fn fetch_files(&self) -> impl Future<Output = Result<Vec<FileRecord>, ClientError>> + Send;

    fn fetch_messages(&self) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send;

    fn delete_file(&self, filename: &str) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn upload_file(
        &self,
        path: &Path,
        progress: ProgressFn,
    ) -> impl Future<Output = Result<FileRecord, ClientError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// How the server advertises itself to other devices on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    pub local_ip: String,
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lanshare/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    /// Uploads in-memory bytes under `filename_hint`.
    pub async fn upload_bytes(
        &self,
        bytes: Bytes,
        filename_hint: &str,
        progress: ProgressFn,
    ) -> Result<FileRecord, ClientError> {
        let endpoint = self.config.endpoint("upload")?;
        let record = upload::upload_bytes(
            &self.http,
            endpoint,
            bytes,
            filename_hint,
            self.config.upload_timeout,
            progress,
        )
        .await?;
        Ok(record)
    }

    pub async fn fetch_info(&self) -> Result<ServerInfo, ClientError> {
        self.get_json("info", "server info").await
    }

    /// Clears the chat log over plain HTTP; the server still broadcasts `messages_cleared`.
    pub async fn clear_messages(&self) -> Result<(), ClientError> {
        let url = self.config.endpoint("clear_messages")?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Connection(format!(
                "clear messages failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Streams a stored file to `dest`, returning the byte count.
    pub async fn download_file(&self, filename: &str, dest: &Path) -> Result<u64, ClientError> {
        let url = self.config.file_endpoint("download", filename)?;
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ClientError::Download(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let reason = error_reason(response).await;
            return Err(ClientError::Download(format!("HTTP {status}: {reason}")));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| ClientError::Download(err.to_string()))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| ClientError::Download(err.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| ClientError::Download(err.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| ClientError::Download(err.to_string()))?;
        info!(filename, bytes = written, dest = %dest.display(), "download complete");
        Ok(written)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        what: &'static str,
    ) -> Result<T, ClientError> {
        let url = self.config.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ClientError::fetch(what, err))?;
        if !response.status().is_success() {
            return Err(ClientError::fetch(
                what,
                format!("HTTP {}", response.status()),
            ));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ClientError::fetch(what, err))
    }
}

impl FileService for ApiClient {
    async fn fetch_files(&self) -> Result<Vec<FileRecord>, ClientError> {
        let files: Vec<FileRecord> = self.get_json("files", "files").await?;
        debug!(count = files.len(), "file snapshot loaded");
        Ok(files)
    }

    async fn fetch_messages(&self) -> Result<Vec<Message>, ClientError> {
        self.get_json("messages", "messages").await
    }

    async fn delete_file(&self, filename: &str) -> Result<(), ClientError> {
        let url = self.config.file_endpoint("delete", filename)?;
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|err| ClientError::delete(filename, err))?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(ClientError::delete(filename, error_reason(response).await))
    }

    async fn upload_file(&self, path: &Path, progress: ProgressFn) -> Result<FileRecord, ClientError> {
        let endpoint = self.config.endpoint("upload")?;
        let record = upload::upload_path(
            &self.http,
            endpoint,
            path,
            self.config.upload_timeout,
            progress,
        )
        .await?;
        Ok(record)
    }
}

async fn error_reason(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(ErrorBody { error: Some(error) }) => error,
        _ => status.to_string(),
    }
}
