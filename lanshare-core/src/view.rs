//! Client-side view of the shared file list and chat log.
//!
//! [`ClientViewState`] is changed in exactly two ways: wholesale snapshot
//! loads and incremental [`SyncEvent`]s. Both paths are idempotent so a
//! snapshot taken after a burst of events converges to the same state.

use std::collections::{HashMap, VecDeque};

use crate::{FileRecord, Filename, MESSAGE_HISTORY_LIMIT, Message, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the synchronizer reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    FileUploaded(FileRecord),
    FileDeleted { filename: Filename },
    NewMessage(Message),
    MessagesCleared,
    ConnectionStateChanged(ConnectionState),
}

impl From<ServerEvent> for SyncEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::NewMessage(message) => SyncEvent::NewMessage(message),
            ServerEvent::FileUploaded(record) => SyncEvent::FileUploaded(record),
            ServerEvent::FileDeleted(deleted) => SyncEvent::FileDeleted {
                filename: deleted.filename,
            },
            ServerEvent::MessagesCleared => SyncEvent::MessagesCleared,
        }
    }
}

/// What an applied event actually changed. Idempotent no-ops report `Unchanged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    FileAdded(FileRecord),
    FileRemoved(FileRecord),
    MessageAppended(Message),
    MessagesCleared,
    Connection(ConnectionState),
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStats {
    pub count: usize,
    pub total_bytes: u64,
}

impl FileStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FileRecord>) -> Self {
        records
            .into_iter()
            .fold(FileStats::default(), |stats, record| FileStats {
                count: stats.count + 1,
                total_bytes: stats.total_bytes.saturating_add(record.size),
            })
    }

    pub fn formatted_total(&self) -> String {
        format_file_size(self.total_bytes)
    }
}

/// Human-readable size with binary units and at most two decimals ("6 KB", "1.5 MB").
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_owned();
    }

    let mut exponent = 0usize;
    while exponent + 1 < UNITS.len() && bytes >= 1024_u64.pow(exponent as u32 + 1) {
        exponent += 1;
    }

    let value = bytes as f64 / 1024_f64.powi(exponent as i32);
    let fixed = format!("{value:.2}");
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[exponent])
}

#[derive(Debug, Clone, Default)]
pub struct ClientViewState {
    files: HashMap<Filename, FileRecord>,
    order: VecDeque<Filename>,
    messages: Vec<Message>,
    connection: ConnectionState,
}

impl ClientViewState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the file list with a server snapshot, keeping the server's order.
    pub fn load_files(&mut self, records: Vec<FileRecord>) {
        self.files.clear();
        self.order.clear();
        for record in records {
            if self.files.contains_key(&record.filename) {
                continue;
            }
            self.order.push_back(record.filename.clone());
            self.files.insert(record.filename.clone(), record);
        }
    }

    /// Keeps only the newest [`MESSAGE_HISTORY_LIMIT`] messages.
    pub fn load_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.trim_messages();
    }

    pub fn apply(&mut self, event: SyncEvent) -> Change {
        match event {
            SyncEvent::FileUploaded(record) => {
                if self.files.contains_key(&record.filename) {
                    return Change::Unchanged;
                }
                self.order.push_front(record.filename.clone());
                self.files.insert(record.filename.clone(), record.clone());
                Change::FileAdded(record)
            }
            SyncEvent::FileDeleted { filename } => match self.files.remove(&filename) {
                Some(record) => {
                    self.order.retain(|name| *name != filename);
                    Change::FileRemoved(record)
                }
                None => Change::Unchanged,
            },
            SyncEvent::NewMessage(message) => {
                self.messages.push(message.clone());
                self.trim_messages();
                Change::MessageAppended(message)
            }
            SyncEvent::MessagesCleared => {
                self.messages.clear();
                Change::MessagesCleared
            }
            // Displayed state survives a disconnect; only the indicator moves.
            SyncEvent::ConnectionStateChanged(state) => {
                if self.connection == state {
                    return Change::Unchanged;
                }
                self.connection = state;
                Change::Connection(state)
            }
        }
    }

    fn trim_messages(&mut self) {
        let excess = self.messages.len().saturating_sub(MESSAGE_HISTORY_LIMIT);
        if excess > 0 {
            self.messages.drain(..excess);
        }
    }

    /// Files in display order, newest push first.
    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.order.iter().filter_map(|name| self.files.get(name))
    }

    pub fn filenames(&self) -> Vec<Filename> {
        self.order.iter().cloned().collect()
    }

    pub fn file(&self, filename: &str) -> Option<&FileRecord> {
        self.files.get(filename)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Always recomputed from the records themselves.
    pub fn stats(&self) -> FileStats {
        FileStats::from_records(self.files.values())
    }
}
