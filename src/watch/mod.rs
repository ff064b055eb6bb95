//! Filesystem watching: OS events → normalized, debounced event stream.
//!
//! The [`watcher`] task turns `notify` events into [`RawPathEvent`]s filtered
//! by glob patterns; the [`debounce`] task coalesces them per `(type, path)`
//! key and suppresses echoes of the engine's own writes.

pub mod debounce;
pub mod glob;
pub mod watcher;

use std::time::Duration;
use tokio::task::JoinHandle;

pub use debounce::{event_debouncer_task, InternalWriteTags, PathEvent, DEFAULT_DEBOUNCE_MS};
pub use watcher::{
    spawn_path_watcher, EventFilter, RawPathEvent, WatchError, WatchFailure, WatchRegistration,
};

/// Default lifetime of an internal-write tag with no matching event.
pub const DEFAULT_TAG_EXPIRY_MS: u64 = 5_000;

/// Watch-side configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Coalescing window for filesystem events. Zero disables coalescing.
    pub debounce: Duration,
    /// Expiry for internal-write tags with no matching event. Configurable
    /// because filesystem layers that coalesce writes over longer intervals
    /// would otherwise mis-suppress external changes.
    pub tag_expiry: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            tag_expiry: Duration::from_millis(DEFAULT_TAG_EXPIRY_MS),
        }
    }
}

/// Disposable handle for one watch registration. Dropping (or calling
/// [`WatchHandle::dispose`]) stops the watcher and debouncer tasks.
#[derive(Debug)]
pub struct WatchHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn dispose(self) {
        // Drop does the work.
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
