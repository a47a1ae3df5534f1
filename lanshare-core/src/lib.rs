use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod locale;
pub mod view;

pub use locale::{Locale, MessageKey};
pub use view::{Change, ClientViewState, ConnectionState, FileStats, SyncEvent, format_file_size};

pub const MAX_MESSAGE_TEXT_BYTES: usize = 4 * 1024;
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const MESSAGE_HISTORY_LIMIT: usize = 100;

pub type Filename = String;

/// Metadata for one stored upload. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: Filename,
    pub original_name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDeleted {
    pub filename: Filename,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessage {
    pub text: String,
}

/// Events pushed from the server to every connected client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(Message),
    FileUploaded(FileRecord),
    FileDeleted(FileDeleted),
    MessagesCleared,
}

/// Lightweight commands a client issues over the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    SendMessage(SendMessage),
    ClearMessages,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Event(ServerEvent),
    Command(ClientCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    ServerEvent = 0,
    ClientCommand = 1,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("message text exceeds {MAX_MESSAGE_TEXT_BYTES} bytes")]
    MessageTooLong,
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unknown locale {0:?} (expected \"en\" or \"zh\")")]
    UnknownLocale(String),
}

/// Trims chat text before it goes on the wire.
///
/// Returns `Ok(None)` for blank input, which callers treat as a silent no-op.
pub fn prepare_message_text(text: &str) -> Result<Option<String>, CoreError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_MESSAGE_TEXT_BYTES {
        return Err(CoreError::MessageTooLong);
    }
    Ok(Some(trimmed.to_owned()))
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Event(event) => (MessageType::ServerEvent as u8, serde_json::to_vec(event)),
        WireMessage::Command(command) => (
            MessageType::ClientCommand as u8,
            serde_json::to_vec(command),
        ),
    };
    let payload = payload.map_err(|err| CoreError::Serialization(err.to_string()))?;

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() < 5 || frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::ServerEvent as u8 => serde_json::from_slice(payload)
            .map(WireMessage::Event)
            .map_err(|err| CoreError::Serialization(err.to_string())),
        x if x == MessageType::ClientCommand as u8 => serde_json::from_slice(payload)
            .map(WireMessage::Command)
            .map_err(|err| CoreError::Serialization(err.to_string())),
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}
