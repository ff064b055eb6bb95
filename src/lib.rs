//! tether: a two-sided file-synchronization engine.
//!
//! Keeps an in-editor document buffer and a file on disk consistent under
//! concurrent mutation from both sides. The host process owns disk access
//! (file operations, path watching, debounced autosave); the sandboxed view
//! process owns the buffer state machine; an ordered request/response bridge
//! connects them.
//!
//! The three subsystems that carry the design:
//!
//! - [`autosave`]: per-path debounced write-back with retries, optional
//!   backups, and internal-write tagging.
//! - [`watch`]: OS file events, normalized, debounced per `(type, path)`,
//!   with echoes of our own writes suppressed by tag consumption.
//! - [`session`]: the view-side buffer state machine that reconciles user
//!   edits, save echoes, and external changes without ever losing a buffer.

pub mod autosave;
pub mod bridge;
pub mod diagnostics;
pub mod engine;
pub mod fileops;
pub mod session;
pub mod watch;

pub use tether_types as types;

pub use autosave::{AutosaveConfig, AutosaveQueue, SaveOptions, SaveOutcome, SaveTicket};
pub use bridge::{pair as bridge_pair, BridgeConfig, BridgeEndpoint, BridgeError};
pub use diagnostics::{DiagnosticsSink, FileReport, MemorySink, TracingSink};
pub use engine::{acquire_engine_lock, Engine, EngineConfig};
pub use fileops::{FileOps, FileOpsConfig, FileStore, ReadOptions, WriteOptions};
pub use session::{
    spawn_session, ConflictChoice, EditSession, SessionConfig, SessionHandle, SessionState,
    UiCommand, UiEvent,
};
pub use watch::{InternalWriteTags, WatchConfig, WatchHandle, WatchRegistration};
