//! View-side edit session: buffer state machine plus its async runtime.

pub mod runtime;
pub mod state;

use std::time::Duration;

pub use runtime::{spawn_session, SessionHandle, UiCommand, UiEvent};
pub use state::{ConflictChoice, EditSession, SessionEffect, SessionEvent, SessionState};

/// Idle window after a user edit during which external changes are deferred.
pub const DEFAULT_EDITING_IDLE_MS: u64 = 1_000;

/// Debounce before a dirty buffer triggers a save request.
pub const DEFAULT_SESSION_AUTOSAVE_MS: u64 = 400;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub editing_idle: Duration,
    pub autosave_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            editing_idle: Duration::from_millis(DEFAULT_EDITING_IDLE_MS),
            autosave_debounce: Duration::from_millis(DEFAULT_SESSION_AUTOSAVE_MS),
        }
    }
}
