//! Host-side engine root.
//!
//! Owns every host subsystem (file operations, internal-write tags, autosave
//! queue, watch registrations) and wires them to the bridge: the view's
//! `save-request`/`read-file`/`write-file` requests route through here, and
//! debounced external changes flow back out as `file-change-external`
//! followed by `file-update`.

use crate::autosave::{AutosaveConfig, AutosaveQueue, SaveOptions, SaveOutcome};
use crate::bridge::{BridgeConfig, BridgeEndpoint};
use crate::diagnostics::{DiagnosticEntry, DiagnosticsSink, FileReport};
use crate::fileops::{FileOps, FileOpsConfig, FileStore, ReadOptions};
use crate::watch::{
    event_debouncer_task, spawn_path_watcher, InternalWriteTags, PathEvent, WatchConfig,
    WatchError, WatchFailure, WatchHandle, WatchRegistration,
};
use fs2::FileExt;
use serde_json::Value;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tether_types::{
    CanonicalPath, ChangeType, FileChangeExternal, FileUpdate, MessageKind, ReadFileRequest,
    ReadFileResponse, SaveComplete, SaveRequest, UpdateReason, WatchFailedNotice,
    WriteFileRequest, WriteFileResponse,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Lock file name guarding a watch root against concurrent engines.
const ENGINE_LOCK_FILENAME: &str = ".tether.lock";

/// Aggregated host configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub fileops: FileOpsConfig,
    pub autosave: AutosaveConfig,
    pub watch: WatchConfig,
    pub bridge: BridgeConfig,
}

/// The host engine.
pub struct Engine {
    fileops: Arc<FileOps>,
    tags: Arc<InternalWriteTags>,
    autosave: AutosaveQueue,
    diagnostics: Arc<dyn DiagnosticsSink>,
    bridge: BridgeEndpoint,
    failure_tx: mpsc::Sender<WatchFailure>,
}

impl Engine {
    /// Build the engine and register its bridge handlers.
    pub async fn new(
        config: EngineConfig,
        diagnostics: Arc<dyn DiagnosticsSink>,
        bridge: BridgeEndpoint,
    ) -> Self {
        let fileops = Arc::new(FileOps::new(config.fileops.clone()));
        let tags = Arc::new(InternalWriteTags::new(config.watch.tag_expiry));
        let store: Arc<dyn FileStore> = fileops.clone();
        let autosave = AutosaveQueue::spawn(
            store,
            tags.clone(),
            diagnostics.clone(),
            config.autosave.clone(),
        );

        let (failure_tx, failure_rx) = mpsc::channel(16);
        tokio::spawn(watch_failure_task(
            failure_rx,
            bridge.clone(),
            diagnostics.clone(),
        ));

        let engine = Self {
            fileops,
            tags,
            autosave,
            diagnostics,
            bridge,
            failure_tx,
        };
        engine.register_handlers().await;
        engine
    }

    pub fn fileops(&self) -> &Arc<FileOps> {
        &self.fileops
    }

    pub fn autosave(&self) -> &AutosaveQueue {
        &self.autosave
    }

    pub fn tags(&self) -> &Arc<InternalWriteTags> {
        &self.tags
    }

    /// Register a watch. Externally-caused events on matching paths are
    /// forwarded to the view; echoes of our own writes are suppressed by the
    /// debouncer before they get that far.
    pub fn watch(&self, registration: WatchRegistration) -> Result<WatchHandle, WatchError> {
        let (raw_tx, raw_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        let watcher_task =
            spawn_path_watcher(registration.clone(), raw_tx, self.failure_tx.clone())?;
        let debouncer_task = tokio::spawn(event_debouncer_task(
            registration.debounce,
            self.tags.clone(),
            raw_rx,
            event_tx,
        ));
        let forward_task = tokio::spawn(forward_external_events(
            event_rx,
            self.bridge.clone(),
            self.fileops.clone(),
            self.diagnostics.clone(),
        ));

        Ok(WatchHandle::new(vec![
            watcher_task,
            debouncer_task,
            forward_task,
        ]))
    }

    /// Push an opaque theme payload to the view.
    pub fn push_theme(&self, payload: Option<Value>) -> Result<(), crate::bridge::BridgeError> {
        self.bridge.send(MessageKind::ThemeChanged, payload)
    }

    /// Push an opaque session-state payload to the view.
    pub fn push_state_restore(
        &self,
        payload: Option<Value>,
    ) -> Result<(), crate::bridge::BridgeError> {
        self.bridge.send(MessageKind::StateRestore, payload)
    }

    /// Immediately perform all pending autosaves.
    pub async fn flush_all(&self) -> Vec<(CanonicalPath, SaveOutcome)> {
        self.autosave.flush_all().await
    }

    async fn register_handlers(&self) {
        // save-request: debounced write through the autosave queue. The
        // response reuses the save-complete payload.
        let autosave = self.autosave.clone();
        self.bridge
            .on(MessageKind::SaveRequest, move |payload| {
                let autosave = autosave.clone();
                Box::pin(async move {
                    let request: SaveRequest = parse_payload(payload)?;
                    let path =
                        CanonicalPath::new(&request.path).map_err(|e| format!("bad path: {e}"))?;
                    let ticket =
                        autosave.schedule(path, request.content.clone(), SaveOptions::default());
                    match ticket.wait().await {
                        SaveOutcome::Written { bytes_written } => {
                            let complete = SaveComplete {
                                path: request.path,
                                content: request.content,
                                bytes_written,
                            };
                            Ok(Some(serde_json::to_value(complete).map_err(|e| e.to_string())?))
                        }
                        SaveOutcome::Superseded => Err("save superseded by newer content".into()),
                        SaveOutcome::Cancelled => Err("save cancelled".into()),
                        SaveOutcome::Failed { last_message } => Err(last_message),
                    }
                })
            })
            .await;

        // read-file: direct FileOps read.
        let fileops = self.fileops.clone();
        self.bridge
            .on(MessageKind::ReadFile, move |payload| {
                let fileops = fileops.clone();
                Box::pin(async move {
                    let request: ReadFileRequest = parse_payload(payload)?;
                    let content = fileops
                        .read(Path::new(&request.path), &ReadOptions::default())
                        .await
                        .map_err(|e| e.to_string())?;
                    let response = ReadFileResponse {
                        content: content.text,
                    };
                    Ok(Some(serde_json::to_value(response).map_err(|e| e.to_string())?))
                })
            })
            .await;

        // write-file: immediate write through the autosave queue's serialized
        // path, so the internal-write tag discipline holds.
        let autosave = self.autosave.clone();
        self.bridge
            .on(MessageKind::WriteFile, move |payload| {
                let autosave = autosave.clone();
                Box::pin(async move {
                    let request: WriteFileRequest = parse_payload(payload)?;
                    let path =
                        CanonicalPath::new(&request.path).map_err(|e| format!("bad path: {e}"))?;
                    let ticket = autosave.write_now(path, request.content, SaveOptions::default());
                    match ticket.wait().await {
                        SaveOutcome::Written { bytes_written } => {
                            let response = WriteFileResponse { bytes_written };
                            Ok(Some(serde_json::to_value(response).map_err(|e| e.to_string())?))
                        }
                        SaveOutcome::Superseded => Err("write superseded".into()),
                        SaveOutcome::Cancelled => Err("write cancelled".into()),
                        SaveOutcome::Failed { last_message } => Err(last_message),
                    }
                })
            })
            .await;
    }
}

async fn forward_external_events(
    mut rx: mpsc::Receiver<PathEvent>,
    bridge: BridgeEndpoint,
    fileops: Arc<FileOps>,
    diagnostics: Arc<dyn DiagnosticsSink>,
) {
    while let Some(event) = rx.recv().await {
        info!(path = %event.path, change = %event.change, "external change detected");

        let notice = FileChangeExternal {
            path: event.path.to_wire(),
            change_type: event.change,
        };
        if bridge
            .send(
                MessageKind::FileChangeExternal,
                serde_json::to_value(&notice).ok(),
            )
            .is_err()
        {
            warn!(path = %event.path, "view detached, dropping external change notice");
            continue;
        }

        // Deletes carry no content; the notice stands alone.
        if event.change == ChangeType::Delete {
            continue;
        }

        match fileops
            .read(event.path.as_path(), &ReadOptions::default())
            .await
        {
            Ok(content) => {
                let update = FileUpdate {
                    path: event.path.to_wire(),
                    content: content.text,
                    reason: UpdateReason::ExternalChange,
                };
                let _ = bridge.send(MessageKind::FileUpdate, serde_json::to_value(&update).ok());
            }
            Err(e) => {
                warn!(path = %event.path, %e, "failed to read externally changed file");
                diagnostics.report(
                    &event.path,
                    FileReport::failure(DiagnosticEntry::error(format!(
                        "external change unreadable: {e}"
                    ))),
                );
            }
        }
    }
}

async fn watch_failure_task(
    mut rx: mpsc::Receiver<WatchFailure>,
    bridge: BridgeEndpoint,
    diagnostics: Arc<dyn DiagnosticsSink>,
) {
    while let Some(failure) = rx.recv().await {
        error!(root = %failure.root.display(), error = %failure.error, "watch registration failed");
        diagnostics.report(
            &CanonicalPath::assume_canonical(failure.root.clone()),
            FileReport::failure(DiagnosticEntry::error(format!(
                "watch failed: {}",
                failure.error
            ))),
        );
        let notice = WatchFailedNotice {
            path: failure.root.display().to_string(),
            error: failure.error,
        };
        let _ = bridge.send(MessageKind::WatchFailed, serde_json::to_value(&notice).ok());
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Option<Value>) -> Result<T, String> {
    let value = payload.ok_or_else(|| "missing payload".to_string())?;
    serde_json::from_value(value).map_err(|e| format!("malformed payload: {e}"))
}

/// Acquire an exclusive lock on a watch root so two engines cannot autosave
/// the same tree concurrently. The returned handle must be kept alive for
/// the engine's lifetime.
pub fn acquire_engine_lock(directory: &Path) -> io::Result<File> {
    let lock_path = directory.join(ENGINE_LOCK_FILENAME);
    let lock_file = File::create(&lock_path)?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            info!(directory = %directory.display(), "acquired engine lock");
            Ok(lock_file)
        }
        Err(e) => {
            error!(
                directory = %directory.display(),
                %e,
                "another engine already holds the lock for this directory"
            );
            Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("another engine is running for {}", directory.display()),
            ))
        }
    }
}
