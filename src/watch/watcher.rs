//! Path watcher task built on the `notify` crate.
//!
//! Turns OS filesystem notifications into a normalized stream of
//! [`RawPathEvent`]s. Rename events are resolved to create/delete so that
//! atomic-write editors (write temp, rename over target) are observed as
//! ordinary changes. The watcher knows nothing about internal-write tags;
//! suppression happens downstream in the debouncer.

use crate::fileops::now_epoch_ms;
use crate::watch::glob::{glob_match, is_ignored};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_types::{CanonicalPath, ChangeType};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive watcher-stream errors tolerated before the registration is
/// disposed and a failure is reported.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Watcher creation or registration failure, surfaced to the caller.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create watcher: {0}")]
    Creation(#[from] notify::Error),

    #[error("watch root is invalid: {0}")]
    InvalidRoot(#[from] std::io::Error),
}

/// Persistent runtime failure of a running watcher.
#[derive(Debug, Clone)]
pub struct WatchFailure {
    pub root: PathBuf,
    pub error: String,
}

/// Which change types a registration forwards.
#[derive(Debug, Clone, Copy)]
pub struct EventFilter {
    pub create: bool,
    pub modify: bool,
    pub delete: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            create: true,
            modify: true,
            delete: true,
        }
    }
}

impl EventFilter {
    pub fn allows(&self, change: ChangeType) -> bool {
        match change {
            ChangeType::Create => self.create,
            ChangeType::Modify => self.modify,
            ChangeType::Delete => self.delete,
        }
    }
}

/// One watch request: root, glob pattern, ignores, event mask, debounce.
#[derive(Debug, Clone)]
pub struct WatchRegistration {
    pub root: PathBuf,
    /// Glob relative to `root`; `None` watches everything under the root.
    pub pattern: Option<String>,
    pub ignore: Vec<String>,
    pub events: EventFilter,
    pub debounce: Duration,
}

impl WatchRegistration {
    pub fn all_of(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pattern: None,
            ignore: Vec::new(),
            events: EventFilter::default(),
            debounce: Duration::from_millis(crate::watch::DEFAULT_DEBOUNCE_MS),
        }
    }
}

/// A raw (pre-debounce) filesystem event.
#[derive(Debug, Clone)]
pub struct RawPathEvent {
    pub change: ChangeType,
    pub path: CanonicalPath,
    pub at_ms: u64,
}

/// Create the OS watcher for a registration and spawn the forwarding task.
///
/// Creation failure is returned to the caller. Once running, transient errors
/// are logged and watching continues; after `MAX_CONSECUTIVE_ERRORS` stream
/// errors in a row the task reports a [`WatchFailure`] and exits.
pub fn spawn_path_watcher(
    registration: WatchRegistration,
    tx: mpsc::Sender<RawPathEvent>,
    failure_tx: mpsc::Sender<WatchFailure>,
) -> Result<JoinHandle<()>, WatchError> {
    let root = registration.root.canonicalize()?;

    let (notify_tx, notify_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = notify_tx.blocking_send(res);
        },
        Config::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    info!(root = %root.display(), pattern = ?registration.pattern, "watching path set");

    Ok(tokio::spawn(forward_events(
        watcher,
        root,
        registration,
        notify_rx,
        tx,
        failure_tx,
    )))
}

async fn forward_events(
    // Held so the OS watcher stays alive for the task's lifetime.
    _watcher: RecommendedWatcher,
    root: PathBuf,
    registration: WatchRegistration,
    mut notify_rx: mpsc::Receiver<Result<Event, notify::Error>>,
    tx: mpsc::Sender<RawPathEvent>,
    failure_tx: mpsc::Sender<WatchFailure>,
) {
    let mut consecutive_errors = 0u32;

    while let Some(result) = notify_rx.recv().await {
        match result {
            Ok(event) => {
                consecutive_errors = 0;
                for (path, change) in classify(&event) {
                    if !registration.events.allows(change) {
                        continue;
                    }
                    if !matches_registration(&registration, &root, &path) {
                        continue;
                    }
                    // Directory events are not part of the stream; documents
                    // are files.
                    if change != ChangeType::Delete && path.is_dir() {
                        continue;
                    }
                    let canonical = match CanonicalPath::new(&path) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(path = %path.display(), %e, "skipping uncanonicalizable path");
                            continue;
                        }
                    };
                    let raw = RawPathEvent {
                        change,
                        path: canonical,
                        at_ms: now_epoch_ms(),
                    };
                    if tx.send(raw).await.is_err() {
                        // Receiver dropped: registration disposed.
                        return;
                    }
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(root = %root.display(), %e, consecutive_errors, "watcher stream error");
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(root = %root.display(), %e, "persistent watch failure, disposing registration");
                    let _ = failure_tx
                        .send(WatchFailure {
                            root: root.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

/// Map a notify event to `(path, change)` pairs.
///
/// Renames become delete (source) / create (destination); platforms that
/// cannot tell which side a path was on are resolved by an existence check.
fn classify(event: &Event) -> Vec<(PathBuf, ChangeType)> {
    let mut out = Vec::new();
    for path in &event.paths {
        let change = match &event.kind {
            EventKind::Create(_) => Some(ChangeType::Create),
            EventKind::Remove(_) => Some(ChangeType::Delete),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => Some(ChangeType::Delete),
                RenameMode::To => Some(ChangeType::Create),
                RenameMode::Both | RenameMode::Any | RenameMode::Other => {
                    if path.exists() {
                        Some(ChangeType::Create)
                    } else {
                        Some(ChangeType::Delete)
                    }
                }
            },
            kind if kind.is_modify() => Some(ChangeType::Modify),
            _ => None,
        };
        if let Some(change) = change {
            out.push((path.clone(), change));
        }
    }
    out
}

fn matches_registration(registration: &WatchRegistration, root: &Path, path: &Path) -> bool {
    let relative = match path.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => {
            // Outside the canonical root (symlink escape): not ours.
            return false;
        }
    };
    if relative.is_empty() {
        return false;
    }
    if is_ignored(&registration.ignore, &relative) {
        return false;
    }
    match &registration.pattern {
        Some(pattern) => glob_match(pattern, &relative),
        None => true,
    }
}
