use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use lanshare_core::{FileRecord, Filename};
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};
use tracing::{debug, info, warn};

use crate::error::ServerError;

const MAX_ORIGINAL_NAME_LEN: usize = 128;
const MAX_ALLOCATE_ATTEMPTS: u32 = 3;

/// Uploaded blobs on disk plus their metadata, oldest first.
#[derive(Debug)]
pub struct FileRegistry {
    dir: PathBuf,
    entries: RwLock<Vec<FileRecord>>,
}

/// An upload being streamed to disk. Either committed into the registry or aborted.
#[derive(Debug)]
pub struct PendingUpload {
    file: fs::File,
    path: PathBuf,
    filename: Filename,
    original_name: String,
    size: u64,
}

impl PendingUpload {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ServerError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|err| ServerError::Storage(err.to_string()))?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    pub async fn abort(self) {
        drop(self.file);
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), "failed to remove partial upload: {err}");
        }
    }
}

impl FileRegistry {
    pub async fn new(dir: PathBuf) -> Result<Self, ServerError> {
        fs::create_dir_all(&dir).await.map_err(|err| {
            ServerError::Storage(format!(
                "failed to create upload directory '{}': {}",
                dir.display(),
                err
            ))
        })?;

        info!(path = %dir.display(), "file registry initialized");

        Ok(Self {
            dir,
            entries: RwLock::new(Vec::new()),
        })
    }

    pub async fn begin(&self, original_name: &str) -> Result<PendingUpload, ServerError> {
        let original_name = original_name.trim();
        if original_name.is_empty() {
            return Err(ServerError::NoFileSelected);
        }

        let mut attempt = 1;
        loop {
            let filename = allocate_filename(original_name);
            let path = self.dir.join(&filename);
            match create_blob(&path).await {
                Ok(file) => {
                    return Ok(PendingUpload {
                        file,
                        path,
                        filename,
                        original_name: original_name.to_owned(),
                        size: 0,
                    });
                }
                Err(err)
                    if err.kind() == io::ErrorKind::AlreadyExists
                        && attempt < MAX_ALLOCATE_ATTEMPTS =>
                {
                    warn!(%filename, attempt, "identifier collision, reallocating");
                    attempt += 1;
                }
                Err(err) => return Err(ServerError::Storage(err.to_string())),
            }
        }
    }

    pub async fn commit(&self, mut pending: PendingUpload) -> Result<FileRecord, ServerError> {
        if let Err(err) = pending.file.flush().await {
            let message = err.to_string();
            pending.abort().await;
            return Err(ServerError::Storage(message));
        }

        let record = FileRecord {
            url: Some(download_url(&pending.filename)),
            filename: pending.filename,
            original_name: pending.original_name,
            size: pending.size,
            uploaded_at: Utc::now(),
        };

        self.entries.write().await.push(record.clone());
        debug!(filename = %record.filename, size = record.size, "upload committed");
        Ok(record)
    }

    /// Most recent upload first.
    pub async fn list(&self) -> Vec<FileRecord> {
        self.entries.read().await.iter().rev().cloned().collect()
    }

    pub async fn get(&self, filename: &str) -> Option<FileRecord> {
        self.entries
            .read()
            .await
            .iter()
            .find(|record| record.filename == filename)
            .cloned()
    }

    /// Disk path of a registered file. Unregistered names never resolve.
    pub async fn path_of(&self, filename: &str) -> Option<PathBuf> {
        self.get(filename).await.map(|record| self.dir.join(record.filename))
    }

    pub async fn remove(&self, filename: &str) -> Result<FileRecord, ServerError> {
        let mut entries = self.entries.write().await;
        let index = entries
            .iter()
            .position(|record| record.filename == filename)
            .ok_or(ServerError::FileNotFound)?;

        match fs::remove_file(self.dir.join(filename)).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(filename, "blob already missing on disk");
            }
            Err(err) => return Err(ServerError::Internal(err.to_string())),
        }

        Ok(entries.remove(index))
    }

    pub async fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Filename> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.entries
            .read()
            .await
            .iter()
            .filter(|record| now.signed_duration_since(record.uploaded_at) > ttl)
            .map(|record| record.filename.clone())
            .collect()
    }
}

pub fn download_url(filename: &str) -> String {
    format!("/download/{filename}")
}

/// Never opens an existing path, so a live blob cannot be truncated.
async fn create_blob(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

fn allocate_filename(original_name: &str) -> Filename {
    let id: [u8; 16] = rand::random();
    format!("{}_{}", hex::encode(id), sanitize_file_name(original_name))
}

pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "file.bin".to_string();
    }
    let mut out = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        if matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '%' | '#')
            || ch.is_control()
        {
            out.push('_');
        } else {
            out.push(ch);
        }
        if out.len() >= MAX_ORIGINAL_NAME_LEN {
            break;
        }
    }
    if out == "." || out == ".." {
        return "file.bin".to_string();
    }
    out
}
