//! Per-path debounced writer with retries, optional backup, and
//! loop-prevention tagging.
//!
//! Scheduling the same path again before its timer fires supersedes the
//! pending save; the superseded ticket resolves with `Superseded`, which is
//! not an error. Writes execute inline in the queue task, so writes are
//! serialized: a write in flight always completes before the next pending
//! entry is considered, and no two writes for the same path can overlap.
//!
//! The queue is the only component that installs internal-write tags, and it
//! installs them immediately before each write attempt.

use crate::diagnostics::{DiagnosticEntry, DiagnosticsSink, FileReport};
use crate::fileops::{now_epoch_ms, FileStore};
use crate::watch::InternalWriteTags;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_types::{CanonicalPath, FileMetadata};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default debounce window before a scheduled save is written.
pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 400;

/// Default number of retries after a failed write.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for retry backoff; attempt N waits N times this.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for the back-pressure-stretched debounce window.
const MAX_STRETCHED_DEBOUNCE: Duration = Duration::from_secs(2);

/// Supersessions within one write window that trigger window stretching.
const SUPERSESSION_WARN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    pub debounce: Duration,
    pub max_retries: u32,
    /// Write a timestamped backup copy before overwriting an existing file.
    /// Backups are never removed automatically.
    pub backup: bool,
    /// Install internal-write tags so the debouncer drops our own echoes.
    pub flag_internal_writes: bool,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_AUTOSAVE_DEBOUNCE_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            backup: false,
            flag_internal_writes: true,
        }
    }
}

/// Per-schedule overrides of the queue configuration.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub backup: Option<bool>,
    pub max_retries: Option<u32>,
}

/// Terminal outcome of one scheduled save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Written { bytes_written: u64 },
    /// A newer schedule for the same path replaced this one.
    Superseded,
    Cancelled,
    Failed { last_message: String },
}

/// Future for one specific schedule call.
#[derive(Debug)]
pub struct SaveTicket {
    rx: oneshot::Receiver<SaveOutcome>,
}

impl SaveTicket {
    /// Resolves when this submission is written, superseded, cancelled, or
    /// has exhausted its retries.
    pub async fn wait(self) -> SaveOutcome {
        self.rx.await.unwrap_or(SaveOutcome::Cancelled)
    }
}

enum Command {
    Schedule {
        path: CanonicalPath,
        content: String,
        options: SaveOptions,
        done: oneshot::Sender<SaveOutcome>,
    },
    /// Execute through the same serialized, tagged, retried path but without
    /// waiting for the debounce window.
    WriteNow {
        path: CanonicalPath,
        content: String,
        options: SaveOptions,
        done: oneshot::Sender<SaveOutcome>,
    },
    Cancel {
        path: CanonicalPath,
        reply: oneshot::Sender<bool>,
    },
    FlushAll {
        reply: oneshot::Sender<Vec<(CanonicalPath, SaveOutcome)>>,
    },
}

/// Handle to the autosave queue task. Cheap to clone.
#[derive(Clone)]
pub struct AutosaveQueue {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl AutosaveQueue {
    /// Spawn the queue task.
    pub fn spawn(
        store: Arc<dyn FileStore>,
        tags: Arc<InternalWriteTags>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        config: AutosaveConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(queue_task(store, tags, diagnostics, config, cmd_rx));
        Self { cmd_tx }
    }

    /// Schedule a debounced save, replacing any pending content for the path.
    pub fn schedule(
        &self,
        path: CanonicalPath,
        content: String,
        options: SaveOptions,
    ) -> SaveTicket {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self.cmd_tx.send(Command::Schedule {
            path,
            content,
            options,
            done,
        }) {
            if let Command::Schedule { done, .. } = cmd {
                let _ = done.send(SaveOutcome::Cancelled);
            }
        }
        SaveTicket { rx }
    }

    /// Write immediately through the serialized write path.
    pub fn write_now(
        &self,
        path: CanonicalPath,
        content: String,
        options: SaveOptions,
    ) -> SaveTicket {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self.cmd_tx.send(Command::WriteNow {
            path,
            content,
            options,
            done,
        }) {
            if let Command::WriteNow { done, .. } = cmd {
                let _ = done.send(SaveOutcome::Cancelled);
            }
        }
        SaveTicket { rx }
    }

    /// Cancel any pending timer for the path. Returns whether one existed.
    /// A write that has already started is not aborted; it completes.
    pub async fn cancel(&self, path: &CanonicalPath) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Cancel {
                path: path.clone(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Immediately perform all pending writes and return their outcomes.
    pub async fn flush_all(&self) -> Vec<(CanonicalPath, SaveOutcome)> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::FlushAll { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct PendingAutosave {
    content: String,
    options: SaveOptions,
    deadline: Instant,
    done: oneshot::Sender<SaveOutcome>,
    /// Current (possibly stretched) debounce window for this path.
    window: Duration,
    /// Supersessions observed since the last completed write for this path.
    supersessions: u32,
}

async fn queue_task(
    store: Arc<dyn FileStore>,
    tags: Arc<InternalWriteTags>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    config: AutosaveConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending: HashMap<CanonicalPath, PendingAutosave> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|entry| entry.deadline).min();

        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    for (_, entry) in pending.drain() {
                        let _ = entry.done.send(SaveOutcome::Cancelled);
                    }
                    return;
                };
                match cmd {
                    Command::Schedule { path, content, options, done } => {
                        let mut window = config.debounce;
                        let mut supersessions = 0;
                        if let Some(prev) = pending.remove(&path) {
                            supersessions = prev.supersessions + 1;
                            window = prev.window;
                            let _ = prev.done.send(SaveOutcome::Superseded);
                            debug!(path = %path, supersessions, "superseded pending autosave");
                            if supersessions >= SUPERSESSION_WARN_THRESHOLD {
                                let stretched = (window * 2).min(MAX_STRETCHED_DEBOUNCE);
                                if stretched > window {
                                    warn!(
                                        path = %path,
                                        supersessions,
                                        window_ms = stretched.as_millis() as u64,
                                        "content changing faster than writes complete, stretching debounce window"
                                    );
                                    window = stretched;
                                }
                            }
                        }
                        pending.insert(path, PendingAutosave {
                            content,
                            options,
                            deadline: Instant::now() + window,
                            done,
                            window,
                            supersessions,
                        });
                    }
                    Command::WriteNow { path, content, options, done } => {
                        if let Some(prev) = pending.remove(&path) {
                            let _ = prev.done.send(SaveOutcome::Superseded);
                        }
                        let outcome = execute_write(
                            store.as_ref(), &tags, diagnostics.as_ref(), &config,
                            &path, &content, &options,
                        ).await;
                        let _ = done.send(outcome);
                    }
                    Command::Cancel { path, reply } => {
                        let existed = match pending.remove(&path) {
                            Some(entry) => {
                                let _ = entry.done.send(SaveOutcome::Cancelled);
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(existed);
                    }
                    Command::FlushAll { reply } => {
                        let entries: Vec<_> = pending.drain().collect();
                        let mut results = Vec::with_capacity(entries.len());
                        for (path, entry) in entries {
                            let outcome = execute_write(
                                store.as_ref(), &tags, diagnostics.as_ref(), &config,
                                &path, &entry.content, &entry.options,
                            ).await;
                            let _ = entry.done.send(outcome.clone());
                            results.push((path, outcome));
                        }
                        let _ = reply.send(results);
                    }
                }
            }
            _ = sleep_until_or_never(next_deadline) => {
                let now = Instant::now();
                let due: Vec<CanonicalPath> = pending
                    .iter()
                    .filter(|(_, entry)| entry.deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    let entry = pending.remove(&path).expect("due entry present");
                    let outcome = execute_write(
                        store.as_ref(), &tags, diagnostics.as_ref(), &config,
                        &path, &entry.content, &entry.options,
                    ).await;
                    let _ = entry.done.send(outcome);
                }
            }
        }
    }
}

async fn execute_write(
    store: &dyn FileStore,
    tags: &InternalWriteTags,
    diagnostics: &dyn DiagnosticsSink,
    config: &AutosaveConfig,
    path: &CanonicalPath,
    content: &str,
    options: &SaveOptions,
) -> SaveOutcome {
    let backup = options.backup.unwrap_or(config.backup);
    let max_retries = options.max_retries.unwrap_or(config.max_retries);

    if backup {
        if let Err(e) = write_backup(store, tags, config, path).await {
            // Backup failure never aborts the primary write.
            warn!(path = %path, %e, "backup copy failed, continuing with primary write");
        }
    }

    let started = Instant::now();
    let mut last_message = String::new();

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
        }
        // Tag before the write begins so the watcher event it causes is
        // recognized as ours.
        if config.flag_internal_writes {
            tags.insert(path);
        }
        match store.write(path.as_path(), content).await {
            Ok(bytes_written) => {
                let write_ms = started.elapsed().as_millis() as u64;
                let metadata =
                    FileMetadata::from_text(path.as_path(), content, Some(now_epoch_ms()));
                diagnostics.report(path, FileReport::stats(metadata).with_write_ms(write_ms));
                info!(path = %path, bytes_written, attempt, "autosave write complete");
                return SaveOutcome::Written { bytes_written };
            }
            Err(e) => {
                last_message = e.to_string();
                warn!(path = %path, attempt, %e, "autosave write attempt failed");
                diagnostics.report(
                    path,
                    FileReport::failure(DiagnosticEntry::error(format!(
                        "write attempt {} failed: {}",
                        attempt + 1,
                        e
                    ))),
                );
                if !e.is_retryable() {
                    break;
                }
            }
        }
    }

    error!(path = %path, %last_message, "autosave failed after exhausting retries");
    SaveOutcome::Failed { last_message }
}

async fn write_backup(
    store: &dyn FileStore,
    tags: &InternalWriteTags,
    config: &AutosaveConfig,
    path: &CanonicalPath,
) -> Result<(), tether_types::FileOpsError> {
    // Only back up a file that currently exists.
    if store.stat(path.as_path()).await.is_err() {
        return Ok(());
    }
    let current = store.read(path.as_path()).await?;
    let backup_path = backup_path_for(path);
    // The backup is also our write; without a tag it would surface as a
    // spurious external create.
    if config.flag_internal_writes {
        tags.insert(&backup_path);
    }
    store.write(backup_path.as_path(), &current.text).await?;
    info!(path = %path, backup = %backup_path, "wrote backup copy");
    Ok(())
}

/// `{original_path}.backup-{iso8601}` with `:` and `.` replaced by `-`.
pub fn backup_path_for(path: &CanonicalPath) -> CanonicalPath {
    let stamp = chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    CanonicalPath::assume_canonical(PathBuf::from(format!(
        "{}.backup-{}",
        path.as_path().display(),
        stamp
    )))
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
