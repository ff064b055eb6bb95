//! Bridge wire messages.
//!
//! Messages are JSON records carrying a `kind`, an optional `payload`, and an
//! optional `correlation_id`. Requests carry a correlation id; the matching
//! response echoes the id, sets `reply`, and carries either a payload or an
//! error string. The kind set is closed: deserializing an unknown kind fails,
//! so the bridge fails closed rather than routing surprises.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Every message kind the engine speaks. The serialized strings are stable
/// across implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// host → view: `FileUpdate`
    FileUpdate,
    /// view → host request: `SaveRequest`; response payload is `SaveComplete`
    SaveRequest,
    /// host → view: `SaveComplete`
    SaveComplete,
    /// host → view: `FileChangeExternal`, followed by a `FileUpdate`
    FileChangeExternal,
    /// view → host request: `ReadFileRequest` → `ReadFileResponse`
    ReadFile,
    /// view → host request: `WriteFileRequest` → `WriteFileResponse`
    WriteFile,
    /// host → view: `WatchFailedNotice`
    WatchFailed,
    /// host → view: opaque theme payload
    ThemeChanged,
    /// host → view: opaque session-state payload
    StateRestore,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::FileUpdate => "file-update",
            MessageKind::SaveRequest => "save-request",
            MessageKind::SaveComplete => "save-complete",
            MessageKind::FileChangeExternal => "file-change-external",
            MessageKind::ReadFile => "read-file",
            MessageKind::WriteFile => "write-file",
            MessageKind::WatchFailed => "watch-failed",
            MessageKind::ThemeChanged => "theme-changed",
            MessageKind::StateRestore => "state-restore",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One frame on the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
    /// True for responses; lets the receiver route the frame to a pending
    /// request instead of a handler.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Fire-and-forget message.
    pub fn event(kind: MessageKind, payload: Option<Value>) -> Self {
        Self {
            kind,
            payload,
            correlation_id: None,
            reply: false,
            error: None,
        }
    }

    /// Request expecting a correlated response.
    pub fn request(kind: MessageKind, payload: Option<Value>, correlation_id: u64) -> Self {
        Self {
            kind,
            payload,
            correlation_id: Some(correlation_id),
            reply: false,
            error: None,
        }
    }

    /// Successful response to `request`.
    pub fn response_to(request: &Message, payload: Option<Value>) -> Self {
        Self {
            kind: request.kind,
            payload,
            correlation_id: request.correlation_id,
            reply: true,
            error: None,
        }
    }

    /// Error response to `request`.
    pub fn error_response_to(request: &Message, error: impl Into<String>) -> Self {
        Self {
            kind: request.kind,
            payload: None,
            correlation_id: request.correlation_id,
            reply: true,
            error: Some(error.into()),
        }
    }
}

/// Classification of a filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Modify => "modify",
            ChangeType::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a `file-update` was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateReason {
    InitialLoad,
    ExternalChange,
    SaveEcho,
}

/// `file-update` payload (host → view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    pub content: String,
    pub reason: UpdateReason,
}

/// `save-request` payload (view → host).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub path: String,
    pub content: String,
}

/// `save-complete` payload (host → view, also the `save-request` response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveComplete {
    pub path: String,
    pub content: String,
    pub bytes_written: u64,
}

/// `file-change-external` payload (host → view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeExternal {
    pub path: String,
    pub change_type: ChangeType,
}

/// `read-file` request payload (view → host).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
}

/// `read-file` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResponse {
    pub content: String,
}

/// `write-file` request payload (view → host).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

/// `write-file` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileResponse {
    pub bytes_written: u64,
}

/// `watch-failed` payload (host → view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchFailedNotice {
    pub path: String,
    pub error: String,
}
