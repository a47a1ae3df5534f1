use std::sync::Mutex;

use lanshare_core::{FileRecord, FileStats, Locale, Message, MessageKey, format_file_size};

/// Non-blocking user-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected,
    Disconnected,
    NewFile { original_name: String },
    FileDeleted { filename: String },
    NewMessage(Message),
    MessagesCleared,
    Stats(FileStats),
    Listing { files: Vec<FileRecord>, stats: FileStats },
    Uploading { name: String },
    UploadProgress { name: String, percent: u8 },
    UploadComplete { name: String },
    UploadFailed { name: String, reason: String },
    FileDeletedSuccess { filename: String },
    DeleteFailed { filename: String, reason: String },
    LoadFilesFailed { reason: String },
    LoadMessagesFailed { reason: String },
    Error(String),
}

impl Notice {
    pub fn render(&self, locale: Locale) -> String {
        let t = |key| locale.text(key);
        match self {
            Notice::Connected => t(MessageKey::Connected).to_owned(),
            Notice::Disconnected => t(MessageKey::Disconnected).to_owned(),
            Notice::NewFile { original_name } => {
                format!("{}{}", t(MessageKey::NewFileUploaded), original_name)
            }
            Notice::FileDeleted { .. } => t(MessageKey::FileDeleted).to_owned(),
            Notice::NewMessage(message) => format!(
                "{} ({} {})",
                message.text,
                t(MessageKey::SentAt),
                message.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S")
            ),
            Notice::MessagesCleared => t(MessageKey::MessagesCleared).to_owned(),
            Notice::Stats(stats) => render_stats(locale, stats),
            Notice::Listing { files, stats } => {
                let mut out = format!("{}\n", render_stats(locale, stats));
                if files.is_empty() {
                    out.push_str(t(MessageKey::NoFiles));
                }
                for file in files {
                    out.push_str(&format!(
                        "  {}  {}  {} {}  [{}]\n",
                        file.original_name,
                        format_file_size(file.size),
                        t(MessageKey::UploadedAt),
                        file.uploaded_at
                            .with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M:%S"),
                        file.filename
                    ));
                }
                out.trim_end().to_owned()
            }
            Notice::Uploading { name } => format!("{}{}", t(MessageKey::Uploading), name),
            Notice::UploadProgress { name, percent } => {
                format!("{}{} {}%", t(MessageKey::Uploading), name, percent)
            }
            Notice::UploadComplete { name } => {
                format!("{}{}", t(MessageKey::UploadComplete), name)
            }
            Notice::UploadFailed { name, reason } => {
                format!("{}{} - {}", t(MessageKey::UploadFailed), name, reason)
            }
            Notice::FileDeletedSuccess { .. } => t(MessageKey::FileDeletedSuccess).to_owned(),
            Notice::DeleteFailed { filename, reason } => {
                format!("{} {}: {}", t(MessageKey::ErrorDeletingFile), filename, reason)
            }
            Notice::LoadFilesFailed { reason } => {
                format!("{}: {}", t(MessageKey::ErrorLoadingFiles), reason)
            }
            Notice::LoadMessagesFailed { reason } => {
                format!("{}: {}", t(MessageKey::ErrorLoadingMessages), reason)
            }
            Notice::Error(reason) => reason.clone(),
        }
    }
}

fn render_stats(locale: Locale, stats: &FileStats) -> String {
    format!(
        "{} {} {}  {} {}",
        locale.text(MessageKey::Files),
        locale.text(MessageKey::Total),
        stats.count,
        locale.text(MessageKey::Storage),
        stats.formatted_total()
    )
}

pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notice: Notice);
}

/// Gate for destructive actions.
pub trait Confirm: Send + Sync + 'static {
    fn confirm(&self, prompt: MessageKey) -> bool;
}

/// Answers every prompt the same way; `--yes` on the command line.
#[derive(Debug, Clone, Copy)]
pub struct AssumeAnswer(pub bool);

impl Confirm for AssumeAnswer {
    fn confirm(&self, _prompt: MessageKey) -> bool {
        self.0
    }
}

/// Collects notices in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|notices| notices.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}
