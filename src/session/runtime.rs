//! Session runtime: drives the buffer state machine from UI commands, bridge
//! traffic, and its two timers (autosave debounce, editing idle).
//!
//! The runtime owns the state machine exclusively; every mutation happens in
//! the single task loop, one event to completion before the next, so the
//! session invariants are checkable without locks.

use crate::bridge::{BridgeEndpoint, BridgeError};
use crate::session::state::{
    ConflictChoice, EditSession, SessionEffect, SessionEvent, SessionState,
};
use crate::session::SessionConfig;
use serde_json::Value;
use tether_types::{
    CanonicalPath, ChangeType, FileChangeExternal, FileUpdate, MessageKind, ReadFileRequest,
    ReadFileResponse, SaveComplete, SaveRequest, WatchFailedNotice,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Commands the UI sends into the session.
#[derive(Debug, Clone)]
pub enum UiCommand {
    Edit { content: String },
    Save,
    Resolve(ConflictChoice),
    Close,
}

/// Events the session surfaces to the UI.
#[derive(Debug, Clone)]
pub enum UiEvent {
    StateChanged {
        state: SessionState,
        dirty: bool,
    },
    /// The buffer was replaced wholesale; restore the cursor.
    BufferReplaced {
        content: String,
    },
    ConflictPresented {
        local: String,
        external: String,
    },
    SaveErrored {
        message: String,
    },
    /// The initial load failed (too large, not UTF-8, ...). The session
    /// remains `Initializing`.
    LoadFailed {
        message: String,
    },
    /// A change notice for this path, including deletes, which carry no
    /// follow-up `file-update`.
    ExternalChange {
        change_type: ChangeType,
    },
    ThemeChanged(Option<Value>),
    StateRestore(Option<Value>),
    WatchFailed {
        path: String,
        error: String,
    },
}

enum Inbound {
    InitialLoad(Result<String, String>),
    FileUpdate(FileUpdate),
    ExternalChange(FileChangeExternal),
    SaveCompleted(String),
    SaveFailed { message: String, retryable: bool },
    Theme(Option<Value>),
    StateRestore(Option<Value>),
    WatchFailed(WatchFailedNotice),
}

/// Handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<UiCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn edit(&self, content: impl Into<String>) {
        let _ = self.cmd_tx.send(UiCommand::Edit {
            content: content.into(),
        });
    }

    pub fn save(&self) {
        let _ = self.cmd_tx.send(UiCommand::Save);
    }

    pub fn resolve(&self, choice: ConflictChoice) {
        let _ = self.cmd_tx.send(UiCommand::Resolve(choice));
    }

    /// Close the session: pending autosave and the editing timer are
    /// cancelled, an in-flight save is awaited to completion (its response
    /// discarded), and bridge handlers are unregistered.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(UiCommand::Close);
        let _ = self.task.await;
    }
}

/// Spawn a session for one document and return its handle plus UI events.
pub async fn spawn_session(
    path: CanonicalPath,
    bridge: BridgeEndpoint,
    config: SessionConfig,
) -> (SessionHandle, mpsc::UnboundedReceiver<UiEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    register_inbound_handlers(&bridge, &path, inbound_tx.clone()).await;
    request_initial_load(&bridge, &path, inbound_tx.clone());

    let task = tokio::spawn(session_task(
        path, bridge, config, cmd_rx, inbound_tx, inbound_rx, ui_tx,
    ));

    (SessionHandle { cmd_tx, task }, ui_rx)
}

async fn register_inbound_handlers(
    bridge: &BridgeEndpoint,
    path: &CanonicalPath,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
) {
    let wire_path = path.to_wire();

    let tx = inbound_tx.clone();
    let own_path = wire_path.clone();
    bridge
        .on(MessageKind::FileUpdate, move |payload| {
            let tx = tx.clone();
            let own_path = own_path.clone();
            Box::pin(async move {
                let update: FileUpdate = parse_payload(payload)?;
                if update.path == own_path {
                    let _ = tx.send(Inbound::FileUpdate(update));
                } else {
                    trace!(path = %update.path, "file update for another document");
                }
                Ok(None)
            })
        })
        .await;

    let tx = inbound_tx.clone();
    let own_path = wire_path.clone();
    bridge
        .on(MessageKind::FileChangeExternal, move |payload| {
            let tx = tx.clone();
            let own_path = own_path.clone();
            Box::pin(async move {
                let change: FileChangeExternal = parse_payload(payload)?;
                if change.path == own_path {
                    let _ = tx.send(Inbound::ExternalChange(change));
                }
                Ok(None)
            })
        })
        .await;

    let tx = inbound_tx.clone();
    bridge
        .on(MessageKind::ThemeChanged, move |payload| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(Inbound::Theme(payload));
                Ok(None)
            })
        })
        .await;

    let tx = inbound_tx.clone();
    bridge
        .on(MessageKind::StateRestore, move |payload| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(Inbound::StateRestore(payload));
                Ok(None)
            })
        })
        .await;

    let tx = inbound_tx;
    bridge
        .on(MessageKind::WatchFailed, move |payload| {
            let tx = tx.clone();
            Box::pin(async move {
                let notice: WatchFailedNotice = parse_payload(payload)?;
                let _ = tx.send(Inbound::WatchFailed(notice));
                Ok(None)
            })
        })
        .await;
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Option<Value>) -> Result<T, String> {
    let value = payload.ok_or_else(|| "missing payload".to_string())?;
    serde_json::from_value(value).map_err(|e| format!("malformed payload: {e}"))
}

/// The view pulls the initial content itself over `read-file`. A missing file
/// is the new-document path and loads as empty.
fn request_initial_load(
    bridge: &BridgeEndpoint,
    path: &CanonicalPath,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
) {
    let bridge = bridge.clone();
    let wire_path = path.to_wire();
    tokio::spawn(async move {
        let payload = serde_json::to_value(ReadFileRequest {
            path: wire_path,
        })
        .ok();
        let result = match bridge.request(MessageKind::ReadFile, payload).await {
            Ok(value) => match value {
                Some(value) => match serde_json::from_value::<ReadFileResponse>(value) {
                    Ok(response) => Ok(response.content),
                    Err(e) => Err(format!("malformed read response: {e}")),
                },
                None => Err("empty read response".to_string()),
            },
            Err(BridgeError::Handler(message)) if message.contains("file not found") => {
                Ok(String::new())
            }
            Err(e) => Err(e.to_string()),
        };
        let _ = inbound_tx.send(Inbound::InitialLoad(result));
    });
}

#[allow(clippy::too_many_arguments)]
async fn session_task(
    path: CanonicalPath,
    bridge: BridgeEndpoint,
    config: SessionConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<UiCommand>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
) {
    let session_id = Uuid::new_v4();
    info!(session = %session_id, path = %path, "edit session started");

    let mut session = EditSession::new(path.clone());
    let mut autosave_deadline: Option<Instant> = None;
    let mut editing_deadline: Option<Instant> = None;
    let mut inflight_save: Option<JoinHandle<()>> = None;
    let mut last_observed = (session.state(), session.dirty());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    UiCommand::Edit { content } => {
                        let effects = session.apply(SessionEvent::UserEdit { content });
                        execute_effects(
                            effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                            &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                        );
                    }
                    UiCommand::Save => {
                        let effects = session.apply(SessionEvent::SaveRequested);
                        execute_effects(
                            effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                            &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                        );
                    }
                    UiCommand::Resolve(choice) => {
                        let effects = session.apply(SessionEvent::ResolveConflict(choice));
                        execute_effects(
                            effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                            &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                        );
                    }
                    UiCommand::Close => break,
                }
            }
            inbound = inbound_rx.recv() => {
                let Some(inbound) = inbound else { break };
                match inbound {
                    Inbound::InitialLoad(Ok(content)) => {
                        let effects = session.apply(SessionEvent::HostUpdate { content });
                        execute_effects(
                            effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                            &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                        );
                    }
                    Inbound::InitialLoad(Err(message)) => {
                        warn!(path = %path, %message, "initial load failed");
                        let _ = ui_tx.send(UiEvent::LoadFailed { message });
                    }
                    Inbound::FileUpdate(update) => {
                        let effects = session.apply(SessionEvent::HostUpdate {
                            content: update.content,
                        });
                        execute_effects(
                            effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                            &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                        );
                    }
                    Inbound::ExternalChange(change) => {
                        // Creates and modifies are driven by the follow-up
                        // file-update; only deletes stand alone for the UI.
                        if change.change_type == ChangeType::Delete {
                            let _ = ui_tx.send(UiEvent::ExternalChange {
                                change_type: change.change_type,
                            });
                        } else {
                            trace!(path = %change.path, change = %change.change_type, "external change notice");
                        }
                    }
                    Inbound::SaveCompleted(content) => {
                        inflight_save = None;
                        let effects = session.apply(SessionEvent::SaveCompleted { content });
                        execute_effects(
                            effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                            &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                        );
                    }
                    Inbound::SaveFailed { message, retryable } => {
                        inflight_save = None;
                        let effects = session.apply(SessionEvent::SaveFailed { message, retryable });
                        execute_effects(
                            effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                            &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                        );
                    }
                    Inbound::Theme(payload) => {
                        let _ = ui_tx.send(UiEvent::ThemeChanged(payload));
                    }
                    Inbound::StateRestore(payload) => {
                        let _ = ui_tx.send(UiEvent::StateRestore(payload));
                    }
                    Inbound::WatchFailed(notice) => {
                        let _ = ui_tx.send(UiEvent::WatchFailed {
                            path: notice.path,
                            error: notice.error,
                        });
                    }
                }
            }
            _ = sleep_until_or_never(autosave_deadline) => {
                autosave_deadline = None;
                // A save for content already in flight would be a no-op.
                if session.pending_save() == Some(session.buffer()) {
                    debug!(path = %path, "skipping autosave equal to pending save");
                    continue;
                }
                let effects = session.apply(SessionEvent::SaveRequested);
                execute_effects(
                    effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                    &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                );
            }
            _ = sleep_until_or_never(editing_deadline) => {
                editing_deadline = None;
                let effects = session.apply(SessionEvent::EditingIdle);
                execute_effects(
                    effects, &mut session, &bridge, &config, &ui_tx, &inbound_tx,
                    &mut autosave_deadline, &mut editing_deadline, &mut inflight_save,
                );
            }
        }

        let observed = (session.state(), session.dirty());
        if observed != last_observed {
            last_observed = observed;
            let _ = ui_tx.send(UiEvent::StateChanged {
                state: observed.0,
                dirty: observed.1,
            });
        }
    }

    // Await the in-flight save so the tag lifecycle on the host stays
    // consistent; its completion event is discarded with the channel.
    if let Some(handle) = inflight_save.take() {
        let _ = handle.await;
    }
    bridge.clear_handlers().await;
    info!(session = %session_id, path = %path, "edit session closed");
}

#[allow(clippy::too_many_arguments)]
fn execute_effects(
    effects: Vec<SessionEffect>,
    session: &mut EditSession,
    bridge: &BridgeEndpoint,
    config: &SessionConfig,
    ui_tx: &mpsc::UnboundedSender<UiEvent>,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    autosave_deadline: &mut Option<Instant>,
    editing_deadline: &mut Option<Instant>,
    inflight_save: &mut Option<JoinHandle<()>>,
) {
    for effect in effects {
        match effect {
            SessionEffect::ScheduleAutosave => {
                *autosave_deadline = Some(Instant::now() + config.autosave_debounce);
            }
            SessionEffect::CancelAutosave => {
                *autosave_deadline = None;
            }
            SessionEffect::StartEditingTimer => {
                *editing_deadline = Some(Instant::now() + config.editing_idle);
            }
            SessionEffect::SendSaveRequest { content } => {
                *inflight_save = Some(spawn_save_request(
                    bridge.clone(),
                    session.path().to_wire(),
                    content,
                    inbound_tx.clone(),
                ));
            }
            SessionEffect::BufferReplaced { content } => {
                let _ = ui_tx.send(UiEvent::BufferReplaced { content });
            }
            SessionEffect::ConflictPresented { local, external } => {
                let _ = ui_tx.send(UiEvent::ConflictPresented { local, external });
            }
            SessionEffect::SaveErrored { message } => {
                let _ = ui_tx.send(UiEvent::SaveErrored { message });
            }
        }
    }
}

fn spawn_save_request(
    bridge: BridgeEndpoint,
    wire_path: String,
    content: String,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let payload = serde_json::to_value(SaveRequest {
            path: wire_path,
            content,
        })
        .ok();
        let inbound = match bridge.request(MessageKind::SaveRequest, payload).await {
            Ok(Some(value)) => match serde_json::from_value::<SaveComplete>(value) {
                Ok(done) => Inbound::SaveCompleted(done.content),
                Err(e) => Inbound::SaveFailed {
                    message: format!("malformed save response: {e}"),
                    retryable: false,
                },
            },
            Ok(None) => Inbound::SaveFailed {
                message: "empty save response".to_string(),
                retryable: false,
            },
            Err(BridgeError::Handler(message)) if message.contains("superseded") => {
                // A newer save replaced this one on the host; a rescheduled
                // save converges on the newer content.
                Inbound::SaveFailed {
                    message,
                    retryable: true,
                }
            }
            Err(e) => Inbound::SaveFailed {
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
        };
        let _ = inbound_tx.send(inbound);
    })
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
