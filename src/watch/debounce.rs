//! Event debouncing and internal-write suppression.
//!
//! Raw watcher events are keyed by `(change type, path)` so that a burst of
//! modifies collapses to one event while a delete following a modify is still
//! reported. Before any coalescing, events whose path carries an
//! internal-write tag are consumed silently: they are echoes of the engine's
//! own autosave.

use crate::watch::watcher::RawPathEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tether_types::{CanonicalPath, ChangeType};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default coalescing window for filesystem events.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// A normalized, debounced filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
    pub change: ChangeType,
    pub path: CanonicalPath,
    /// Timestamp of the last raw event folded into this one, ms since epoch.
    pub at_ms: u64,
}

/// The set of paths whose next filesystem event is an echo of our own write.
///
/// Inserted by the autosave queue immediately before each write; consumed by
/// the debouncer on the first matching event. Tags expire after the
/// configured lifetime so that an OS that coalesced our write away cannot
/// suppress an unrelated external change forever.
#[derive(Debug)]
pub struct InternalWriteTags {
    entries: Mutex<HashMap<CanonicalPath, Instant>>,
    expiry: Duration,
}

impl InternalWriteTags {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    /// Tag a path: its next event is an echo. Re-tagging refreshes expiry.
    pub fn insert(&self, path: &CanonicalPath) {
        let deadline = Instant::now() + self.expiry;
        self.entries.lock().unwrap().insert(path.clone(), deadline);
        trace!(path = %path, "installed internal write tag");
    }

    /// Consume a tag for the path if one is live. Returns true when the event
    /// should be suppressed. Expired tags are dropped and do not suppress.
    pub fn consume(&self, path: &CanonicalPath) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(path) {
            Some(deadline) if deadline >= Instant::now() => true,
            Some(_) => {
                trace!(path = %path, "internal write tag expired");
                false
            }
            None => false,
        }
    }

    /// Drop tags whose expiry has passed without a matching event.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.lock().unwrap().retain(|_, deadline| *deadline >= now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Debouncer task: coalesces raw events per `(type, path)` and forwards one
/// normalized event per key per window. A window of zero forwards every
/// event. Exits when either side of the pipe is dropped.
pub async fn event_debouncer_task(
    window: Duration,
    tags: std::sync::Arc<InternalWriteTags>,
    mut rx: mpsc::Receiver<RawPathEvent>,
    tx: mpsc::Sender<PathEvent>,
) {
    let mut pending: HashMap<(ChangeType, CanonicalPath), (Instant, u64)> = HashMap::new();
    // One filesystem write can fan out into several raw events (truncate,
    // data, close). Consuming the tag covers the first; the rest of the
    // burst is suppressed for one debounce window after consumption.
    let mut echo_until: HashMap<CanonicalPath, Instant> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|(deadline, _)| *deadline).min();

        tokio::select! {
            maybe = rx.recv() => {
                let Some(raw) = maybe else { break };
                tags.purge_expired();
                let now = Instant::now();
                echo_until.retain(|_, deadline| *deadline > now);
                if echo_until.contains_key(&raw.path) {
                    trace!(path = %raw.path, "suppressed trailing event of internal write burst");
                    continue;
                }
                if tags.consume(&raw.path) {
                    debug!(path = %raw.path, change = %raw.change, "suppressed echo of internal write");
                    if !window.is_zero() {
                        echo_until.insert(raw.path, now + window);
                    }
                    continue;
                }
                if window.is_zero() {
                    let event = PathEvent { change: raw.change, path: raw.path, at_ms: raw.at_ms };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    continue;
                }
                // Reset the window for this key, keeping the newest payload.
                pending.insert((raw.change, raw.path), (Instant::now() + window, raw.at_ms));
            }
            _ = sleep_until_or_never(next_deadline) => {
                let now = Instant::now();
                let due: Vec<(ChangeType, CanonicalPath)> = pending
                    .iter()
                    .filter(|(_, (deadline, _))| *deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in due {
                    let (_, at_ms) = pending.remove(&key).expect("due key present");
                    let (change, path) = key;
                    if tx.send(PathEvent { change, path, at_ms }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
