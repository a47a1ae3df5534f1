use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    En,
    #[default]
    Zh,
}

impl Locale {
    pub const ALL: [Locale; 2] = [Locale::En, Locale::Zh];

    pub fn code(self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Zh => "zh",
        }
    }

    pub fn text(self, key: MessageKey) -> &'static str {
        match self {
            Locale::En => english(key),
            Locale::Zh => chinese(key),
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Locale {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Locale::En),
            "zh" => Ok(Locale::Zh),
            other => Err(CoreError::UnknownLocale(other.to_owned())),
        }
    }
}

/// Every user-visible string. Adding a variant without translating it fails to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Files,
    Total,
    Storage,
    Messages,
    NoFiles,
    NoMessages,
    Uploading,
    UploadComplete,
    UploadFailed,
    Connected,
    Disconnected,
    NewFileUploaded,
    FileDeleted,
    MessagesCleared,
    ErrorLoadingFiles,
    ErrorLoadingMessages,
    FileDeletedSuccess,
    ErrorDeletingFile,
    ConfirmDeleteFile,
    ConfirmDeleteAll,
    SentAt,
    UploadedAt,
    ServerUrl,
}

impl MessageKey {
    pub const ALL: [MessageKey; 23] = [
        MessageKey::Files,
        MessageKey::Total,
        MessageKey::Storage,
        MessageKey::Messages,
        MessageKey::NoFiles,
        MessageKey::NoMessages,
        MessageKey::Uploading,
        MessageKey::UploadComplete,
        MessageKey::UploadFailed,
        MessageKey::Connected,
        MessageKey::Disconnected,
        MessageKey::NewFileUploaded,
        MessageKey::FileDeleted,
        MessageKey::MessagesCleared,
        MessageKey::ErrorLoadingFiles,
        MessageKey::ErrorLoadingMessages,
        MessageKey::FileDeletedSuccess,
        MessageKey::ErrorDeletingFile,
        MessageKey::ConfirmDeleteFile,
        MessageKey::ConfirmDeleteAll,
        MessageKey::SentAt,
        MessageKey::UploadedAt,
        MessageKey::ServerUrl,
    ];
}

fn english(key: MessageKey) -> &'static str {
    match key {
        MessageKey::Files => "Files",
        MessageKey::Total => "Total:",
        MessageKey::Storage => "Storage:",
        MessageKey::Messages => "Messages",
        MessageKey::NoFiles => "No files available",
        MessageKey::NoMessages => "No messages yet",
        MessageKey::Uploading => "Uploading: ",
        MessageKey::UploadComplete => "Upload complete: ",
        MessageKey::UploadFailed => "Upload failed: ",
        MessageKey::Connected => "Connected to file transfer server",
        MessageKey::Disconnected => "Disconnected from server",
        MessageKey::NewFileUploaded => "New file uploaded: ",
        MessageKey::FileDeleted => "File deleted",
        MessageKey::MessagesCleared => "Messages cleared",
        MessageKey::ErrorLoadingFiles => "Error loading files",
        MessageKey::ErrorLoadingMessages => "Error loading messages",
        MessageKey::FileDeletedSuccess => "File deleted successfully",
        MessageKey::ErrorDeletingFile => "Error deleting file",
        MessageKey::ConfirmDeleteFile => "Are you sure you want to delete this file?",
        MessageKey::ConfirmDeleteAll => "Are you sure you want to delete all files?",
        MessageKey::SentAt => "Sent at",
        MessageKey::UploadedAt => "Uploaded:",
        MessageKey::ServerUrl => "URL:",
    }
}

fn chinese(key: MessageKey) -> &'static str {
    match key {
        MessageKey::Files => "文件",
        MessageKey::Total => "总数:",
        MessageKey::Storage => "存储:",
        MessageKey::Messages => "消息",
        MessageKey::NoFiles => "没有可用文件",
        MessageKey::NoMessages => "暂无消息",
        MessageKey::Uploading => "上传中: ",
        MessageKey::UploadComplete => "上传完成: ",
        MessageKey::UploadFailed => "上传失败: ",
        MessageKey::Connected => "已连接到文件传输服务器",
        MessageKey::Disconnected => "已断开服务器连接",
        MessageKey::NewFileUploaded => "新文件已上传: ",
        MessageKey::FileDeleted => "文件已删除",
        MessageKey::MessagesCleared => "消息已清空",
        MessageKey::ErrorLoadingFiles => "加载文件时出错",
        MessageKey::ErrorLoadingMessages => "加载消息时出错",
        MessageKey::FileDeletedSuccess => "文件删除成功",
        MessageKey::ErrorDeletingFile => "删除文件时出错",
        MessageKey::ConfirmDeleteFile => "确定要删除此文件吗？",
        MessageKey::ConfirmDeleteAll => "确定要删除所有文件吗？",
        MessageKey::SentAt => "发送于",
        MessageKey::UploadedAt => "上传于:",
        MessageKey::ServerUrl => "URL:",
    }
}
