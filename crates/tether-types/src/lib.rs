//! Shared types for the tether sync engine.
//!
//! This crate provides the vocabulary both sides of the engine speak:
//! canonical paths, file content with derived metadata, the bridge wire
//! messages, and file-operation errors.

pub mod content;
pub mod error;
pub mod message;
pub mod path;

pub use content::{FileContent, FileMetadata};
pub use error::FileOpsError;
pub use message::{
    ChangeType, FileChangeExternal, FileUpdate, Message, MessageKind, ReadFileRequest,
    ReadFileResponse, SaveComplete, SaveRequest, UpdateReason, WatchFailedNotice,
    WriteFileRequest, WriteFileResponse,
};
pub use path::CanonicalPath;
