//! View-side buffer state machine.
//!
//! ```text
//!  ┌──────────────┐ HostUpdate ┌───────┐ UserEdit  ┌───────┐
//!  │ INITIALIZING ├───────────►│ CLEAN │◄─────────►│ DIRTY │
//!  └──────────────┘            └───┬───┘           └──┬──┬─┘
//!                    external      │        SaveReq   │  │ external
//!                    (accept in    │      ┌───────────┘  │ (idle)
//!                     place)       ▼      ▼              ▼
//!                              ┌────────┐         ┌──────────────────┐
//!                              │ SAVING │         │ CONFLICT_PENDING │
//!                              └────────┘         └──────────────────┘
//! ```
//!
//! One event is processed to completion before the next; every effect is the
//! output of a transition, never a side effect inside a handler. The runtime
//! executes the returned effects.
//!
//! Echo rule: a `HostUpdate` whose content equals `pending_save` never
//! touches `buffer`; it only moves `last_saved`/`last_external`. This is the
//! rule that keeps the engine's own save from reverting what the user typed
//! after requesting it.

use std::fmt;
use tether_types::CanonicalPath;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the initial load from the host.
    Initializing,
    /// Buffer matches the last persisted content.
    Clean,
    /// Buffer differs from the last persisted content.
    Dirty,
    /// A save request is in flight.
    Saving,
    /// An external change arrived while the user had unsaved edits; waiting
    /// for a `ResolveConflict` choice.
    ConflictPending,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initializing => "INITIALIZING",
            SessionState::Clean => "CLEAN",
            SessionState::Dirty => "DIRTY",
            SessionState::Saving => "SAVING",
            SessionState::ConflictPending => "CONFLICT_PENDING",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User's choice when a conflict is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepLocal,
    AcceptExternal,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Initial load, an external change, or a save echo from the host.
    HostUpdate { content: String },
    UserEdit { content: String },
    /// Autosave timer fired or the user asked to save.
    SaveRequested,
    /// The host persisted `content`.
    SaveCompleted { content: String },
    /// The save request failed terminally (write exhausted retries, peer
    /// error, ...).
    SaveFailed { message: String, retryable: bool },
    /// The `user_editing` idle window elapsed.
    EditingIdle,
    ResolveConflict(ConflictChoice),
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::HostUpdate { .. } => "HOST_UPDATE",
            SessionEvent::UserEdit { .. } => "USER_EDIT",
            SessionEvent::SaveRequested => "SAVE_REQUESTED",
            SessionEvent::SaveCompleted { .. } => "SAVE_COMPLETED",
            SessionEvent::SaveFailed { .. } => "SAVE_FAILED",
            SessionEvent::EditingIdle => "EDITING_IDLE",
            SessionEvent::ResolveConflict(_) => "RESOLVE_CONFLICT",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outputs of a transition, executed by the session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// (Re)arm the autosave debounce timer.
    ScheduleAutosave,
    /// Disarm the autosave debounce timer.
    CancelAutosave,
    /// Arm the `user_editing` idle timer.
    StartEditingTimer,
    /// Send a save request for `content` to the host.
    SendSaveRequest { content: String },
    /// The buffer was replaced wholesale; the UI should restore its cursor.
    BufferReplaced { content: String },
    /// Present a conflict choice carrying both sides' content.
    ConflictPresented { local: String, external: String },
    /// Surface a save failure to the UI. The buffer is never discarded.
    SaveErrored { message: String },
}

/// Single-document buffer state on the view side.
#[derive(Debug)]
pub struct EditSession {
    path: CanonicalPath,
    state: SessionState,
    buffer: String,
    last_saved: String,
    last_external: String,
    pending_save: Option<String>,
    user_editing: bool,
    /// An external change arrived while editing or saving; surface it once
    /// the situation settles.
    conflict_deferred: bool,
}

impl EditSession {
    pub fn new(path: CanonicalPath) -> Self {
        Self {
            path,
            state: SessionState::Initializing,
            buffer: String::new(),
            last_saved: String::new(),
            last_external: String::new(),
            pending_save: None,
            user_editing: false,
            conflict_deferred: false,
        }
    }

    pub fn path(&self) -> &CanonicalPath {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn last_saved(&self) -> &str {
        &self.last_saved
    }

    pub fn last_external(&self) -> &str {
        &self.last_external
    }

    pub fn pending_save(&self) -> Option<&str> {
        self.pending_save.as_deref()
    }

    pub fn user_editing(&self) -> bool {
        self.user_editing
    }

    /// `dirty ⇔ buffer ≠ last_saved`, always computed, never stored.
    pub fn dirty(&self) -> bool {
        self.buffer != self.last_saved
    }

    /// Apply one event and return the effects to execute.
    pub fn apply(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        let from = self.state;
        let event_name = event.as_str();
        let mut effects = Vec::new();

        match event {
            SessionEvent::HostUpdate { content } => self.on_host_update(content, &mut effects),
            SessionEvent::UserEdit { content } => self.on_user_edit(content, &mut effects),
            SessionEvent::SaveRequested => self.on_save_requested(&mut effects),
            SessionEvent::SaveCompleted { content } => self.on_save_completed(content, &mut effects),
            SessionEvent::SaveFailed { message, retryable } => {
                self.on_save_failed(message, retryable, &mut effects)
            }
            SessionEvent::EditingIdle => self.on_editing_idle(&mut effects),
            SessionEvent::ResolveConflict(choice) => self.on_resolve_conflict(choice, &mut effects),
        }

        debug_assert!(
            self.state != SessionState::ConflictPending
                || (self.dirty() && self.last_external != self.buffer),
            "conflict invariant violated"
        );
        debug_assert!(
            (self.state == SessionState::Saving) == self.pending_save.is_some(),
            "pending_save must exist exactly while saving"
        );

        if self.state != from {
            debug!(
                path = %self.path,
                from = %from,
                to = %self.state,
                event = event_name,
                "session state transition"
            );
        }
        effects
    }

    fn on_host_update(&mut self, content: String, effects: &mut Vec<SessionEffect>) {
        if self.state == SessionState::Initializing {
            self.buffer = content.clone();
            self.last_saved = content.clone();
            self.last_external = content;
            self.state = SessionState::Clean;
            effects.push(SessionEffect::BufferReplaced {
                content: self.buffer.clone(),
            });
            return;
        }

        // Echo of our own in-flight save: update the persisted markers only.
        // The buffer is untouched even if the user typed since the request.
        if self.pending_save.as_deref() == Some(content.as_str()) {
            debug!(path = %self.path, "host update matches pending save, treating as echo");
            self.last_saved = content.clone();
            self.last_external = content;
            return;
        }

        match self.state {
            SessionState::Clean => {
                if content != self.last_external {
                    self.buffer = content.clone();
                    self.last_saved = content.clone();
                    self.last_external = content;
                    effects.push(SessionEffect::BufferReplaced {
                        content: self.buffer.clone(),
                    });
                }
            }
            SessionState::Dirty => {
                if content == self.last_external {
                    // Already-known disk state; nothing new.
                } else if content == self.buffer {
                    // Disk caught up with the unsaved edits; adopt as saved.
                    self.last_saved = content.clone();
                    self.last_external = content;
                    self.state = SessionState::Clean;
                    effects.push(SessionEffect::CancelAutosave);
                } else if self.user_editing {
                    // Defer: do not surface while the user is typing, and
                    // hold autosave so the pending decision is not written
                    // over the external content.
                    self.last_external = content;
                    self.conflict_deferred = true;
                    effects.push(SessionEffect::CancelAutosave);
                } else {
                    self.last_external = content;
                    self.state = SessionState::ConflictPending;
                    effects.push(SessionEffect::CancelAutosave);
                    effects.push(SessionEffect::ConflictPresented {
                        local: self.buffer.clone(),
                        external: self.last_external.clone(),
                    });
                }
            }
            SessionState::Saving => {
                // External change racing our save; the completed write will
                // be the authoritative disk state.
                if content != self.last_external {
                    self.last_external = content;
                    self.conflict_deferred = true;
                }
            }
            SessionState::ConflictPending => {
                if content == self.buffer {
                    // The file now matches the local buffer; the conflict
                    // dissolves.
                    self.last_saved = content.clone();
                    self.last_external = content;
                    self.state = SessionState::Clean;
                } else if content != self.last_external {
                    self.last_external = content.clone();
                    effects.push(SessionEffect::ConflictPresented {
                        local: self.buffer.clone(),
                        external: content,
                    });
                }
            }
            SessionState::Initializing => unreachable!("handled above"),
        }
    }

    fn on_user_edit(&mut self, content: String, effects: &mut Vec<SessionEffect>) {
        if self.state == SessionState::Initializing {
            warn!(path = %self.path, "user edit before initial load ignored");
            return;
        }

        self.buffer = content;
        self.user_editing = true;
        effects.push(SessionEffect::StartEditingTimer);

        match self.state {
            SessionState::ConflictPending => {
                if self.buffer == self.last_external {
                    // The user typed the external content; the conflict
                    // evaporates and the disk state is adopted.
                    self.last_saved = self.buffer.clone();
                    self.state = SessionState::Clean;
                    effects.push(SessionEffect::CancelAutosave);
                } else if !self.dirty() {
                    // Typed back to the saved content; the external change
                    // applies in place once the user goes idle.
                    self.state = SessionState::Clean;
                    self.conflict_deferred = true;
                    effects.push(SessionEffect::CancelAutosave);
                }
                // Otherwise the conflict stands; no autosave until resolved.
            }
            SessionState::Saving => {
                // Stay in Saving; completion reschedules if still dirty.
            }
            SessionState::Clean | SessionState::Dirty => {
                if self.conflict_deferred {
                    // Autosave stays held while a conflict is deferred.
                    self.state = if self.dirty() {
                        SessionState::Dirty
                    } else {
                        SessionState::Clean
                    };
                } else if self.dirty() {
                    self.state = SessionState::Dirty;
                    effects.push(SessionEffect::ScheduleAutosave);
                } else {
                    if self.state == SessionState::Dirty {
                        effects.push(SessionEffect::CancelAutosave);
                    }
                    self.state = SessionState::Clean;
                }
            }
            SessionState::Initializing => unreachable!("handled above"),
        }
    }

    fn on_save_requested(&mut self, effects: &mut Vec<SessionEffect>) {
        match self.state {
            SessionState::Dirty if self.conflict_deferred => {
                debug!(path = %self.path, "save held while conflict deferred");
            }
            SessionState::Dirty => {
                self.pending_save = Some(self.buffer.clone());
                self.state = SessionState::Saving;
                effects.push(SessionEffect::SendSaveRequest {
                    content: self.buffer.clone(),
                });
            }
            state => {
                debug!(path = %self.path, %state, "save request ignored");
            }
        }
    }

    fn on_save_completed(&mut self, content: String, effects: &mut Vec<SessionEffect>) {
        if self.state != SessionState::Saving {
            debug!(path = %self.path, state = %self.state, "save completion ignored");
            return;
        }
        self.last_saved = content.clone();
        self.last_external = content;
        self.pending_save = None;
        // Our write is now the authoritative disk state.
        self.conflict_deferred = false;

        if self.dirty() {
            // The user typed while the save was in flight; save again.
            self.state = SessionState::Dirty;
            effects.push(SessionEffect::ScheduleAutosave);
        } else {
            self.state = SessionState::Clean;
        }
    }

    fn on_save_failed(
        &mut self,
        message: String,
        retryable: bool,
        effects: &mut Vec<SessionEffect>,
    ) {
        if self.state != SessionState::Saving {
            debug!(path = %self.path, state = %self.state, "save failure ignored");
            return;
        }
        self.pending_save = None;
        self.state = if self.dirty() {
            SessionState::Dirty
        } else {
            SessionState::Clean
        };
        effects.push(SessionEffect::SaveErrored {
            message: message.clone(),
        });
        warn!(path = %self.path, %message, retryable, "save failed");
        if retryable && self.state == SessionState::Dirty {
            effects.push(SessionEffect::ScheduleAutosave);
        }
    }

    fn on_editing_idle(&mut self, effects: &mut Vec<SessionEffect>) {
        self.user_editing = false;
        if !self.conflict_deferred {
            return;
        }
        match self.state {
            SessionState::Dirty => {
                self.conflict_deferred = false;
                if self.last_external != self.buffer {
                    self.state = SessionState::ConflictPending;
                    effects.push(SessionEffect::ConflictPresented {
                        local: self.buffer.clone(),
                        external: self.last_external.clone(),
                    });
                } else {
                    // Buffer converged on the external content meanwhile.
                    self.last_saved = self.buffer.clone();
                    self.state = SessionState::Clean;
                }
            }
            SessionState::Clean => {
                // The buffer returned to the saved content while deferred;
                // the external change now applies in place.
                self.conflict_deferred = false;
                if self.last_external != self.buffer {
                    self.buffer = self.last_external.clone();
                    self.last_saved = self.last_external.clone();
                    effects.push(SessionEffect::BufferReplaced {
                        content: self.buffer.clone(),
                    });
                }
            }
            // Saving resolves the deferral itself on completion.
            _ => {}
        }
    }

    fn on_resolve_conflict(&mut self, choice: ConflictChoice, effects: &mut Vec<SessionEffect>) {
        if self.state != SessionState::ConflictPending {
            debug!(path = %self.path, state = %self.state, "conflict resolution ignored");
            return;
        }
        match choice {
            ConflictChoice::KeepLocal => {
                self.state = SessionState::Dirty;
                effects.push(SessionEffect::ScheduleAutosave);
            }
            ConflictChoice::AcceptExternal => {
                self.buffer = self.last_external.clone();
                self.last_saved = self.last_external.clone();
                self.state = SessionState::Clean;
                effects.push(SessionEffect::CancelAutosave);
                effects.push(SessionEffect::BufferReplaced {
                    content: self.buffer.clone(),
                });
            }
        }
    }
}
