//! Autosave queue behavior: debounce, supersession, cancellation, flushing,
//! retries, and backups, against a real filesystem.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tether::autosave::{AutosaveConfig, AutosaveQueue, SaveOptions, SaveOutcome};
use tether::diagnostics::{DiagnosticsSink, FileReport};
use tether::fileops::{FileOps, FileStore, WriteOptions};
use tether::watch::InternalWriteTags;
use tether_types::{CanonicalPath, FileContent, FileMetadata, FileOpsError};

/// Store wrapper that fails the first N writes, for retry behavior tests.
struct FlakyStore {
    inner: FileOps,
    failures_remaining: Mutex<u32>,
    write_attempts: AtomicU32,
}

impl FlakyStore {
    fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: FileOps::default(),
            failures_remaining: Mutex::new(failures),
            write_attempts: AtomicU32::new(0),
        })
    }

    fn attempts(&self) -> u32 {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStore for FlakyStore {
    async fn read(&self, path: &Path) -> Result<FileContent, FileOpsError> {
        FileStore::read(&self.inner, path).await
    }

    async fn write(&self, path: &Path, content: &str) -> Result<u64, FileOpsError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut remaining = self.failures_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FileOpsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write failure",
                )));
            }
        }
        self.inner.write(path, content, &WriteOptions::default()).await
    }

    async fn stat(&self, path: &Path) -> Result<FileMetadata, FileOpsError> {
        FileStore::stat(&self.inner, path).await
    }
}

/// Sink that appends every report, so tests can count error diagnostics.
#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(CanonicalPath, FileReport)>>,
}

impl RecordingSink {
    fn error_report_count(&self) -> usize {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, report)| !report.errors.is_empty())
            .count()
    }

    fn last_report_is_stats(&self) -> bool {
        self.reports
            .lock()
            .unwrap()
            .last()
            .map(|(_, report)| report.errors.is_empty() && report.metadata.is_some())
            .unwrap_or(false)
    }
}

impl DiagnosticsSink for RecordingSink {
    fn report(&self, path: &CanonicalPath, report: FileReport) {
        self.reports.lock().unwrap().push((path.clone(), report));
    }
}

struct Fixture {
    _dir: TempDir,
    path: CanonicalPath,
    queue: AutosaveQueue,
    tags: Arc<InternalWriteTags>,
    store: Arc<FlakyStore>,
    sink: Arc<RecordingSink>,
}

fn fixture(failures: u32, config: AutosaveConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = CanonicalPath::new(dir.path().join("doc.md")).unwrap();
    let store = FlakyStore::failing(failures);
    let tags = Arc::new(InternalWriteTags::new(Duration::from_secs(5)));
    let sink = Arc::new(RecordingSink::default());
    let queue = AutosaveQueue::spawn(store.clone(), tags.clone(), sink.clone(), config);
    Fixture {
        _dir: dir,
        path,
        queue,
        tags,
        store,
        sink,
    }
}

fn fast_config() -> AutosaveConfig {
    AutosaveConfig {
        debounce: Duration::from_millis(30),
        ..AutosaveConfig::default()
    }
}

#[tokio::test]
async fn scheduled_write_lands_after_debounce() {
    let f = fixture(0, fast_config());

    let ticket = f
        .queue
        .schedule(f.path.clone(), "hello".into(), SaveOptions::default());
    let outcome = ticket.wait().await;
    assert_eq!(outcome, SaveOutcome::Written { bytes_written: 5 });

    let on_disk = std::fs::read_to_string(f.path.as_path()).unwrap();
    assert_eq!(on_disk, "hello");

    // The write installed an internal tag for the path.
    assert!(f.tags.consume(&f.path));
}

#[tokio::test]
async fn newer_schedule_supersedes_older() {
    let f = fixture(0, fast_config());

    let first = f
        .queue
        .schedule(f.path.clone(), "first".into(), SaveOptions::default());
    let second = f
        .queue
        .schedule(f.path.clone(), "second".into(), SaveOptions::default());

    assert_eq!(first.wait().await, SaveOutcome::Superseded);
    assert_eq!(
        second.wait().await,
        SaveOutcome::Written { bytes_written: 6 }
    );
    assert_eq!(
        std::fs::read_to_string(f.path.as_path()).unwrap(),
        "second"
    );
    assert_eq!(f.store.attempts(), 1);
}

#[tokio::test]
async fn rapid_supersession_writes_once_with_final_content() {
    // A storm of schedules collapses to a single write of the last content.
    // The queue stretches its window under this load, so allow time.
    let f = fixture(0, fast_config());

    let mut last = None;
    for i in 0..100 {
        last = Some(f.queue.schedule(
            f.path.clone(),
            format!("revision {i}"),
            SaveOptions::default(),
        ));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let outcome = tokio::time::timeout(Duration::from_secs(10), last.unwrap().wait())
        .await
        .expect("final save did not resolve");
    assert!(matches!(outcome, SaveOutcome::Written { .. }));
    assert_eq!(
        std::fs::read_to_string(f.path.as_path()).unwrap(),
        "revision 99"
    );
    assert_eq!(f.store.attempts(), 1);
}

#[tokio::test]
async fn cancel_reports_whether_timer_existed() {
    let f = fixture(
        0,
        AutosaveConfig {
            debounce: Duration::from_secs(10),
            ..AutosaveConfig::default()
        },
    );

    let ticket = f
        .queue
        .schedule(f.path.clone(), "never written".into(), SaveOptions::default());
    assert!(f.queue.cancel(&f.path).await);
    assert_eq!(ticket.wait().await, SaveOutcome::Cancelled);
    assert!(!f.queue.cancel(&f.path).await);
    assert!(!f.path.as_path().exists());
}

#[tokio::test]
async fn flush_all_writes_everything_pending() {
    let dir = TempDir::new().unwrap();
    let store = FlakyStore::failing(0);
    let tags = Arc::new(InternalWriteTags::new(Duration::from_secs(5)));
    let sink = Arc::new(RecordingSink::default());
    let queue = AutosaveQueue::spawn(
        store,
        tags,
        sink,
        AutosaveConfig {
            debounce: Duration::from_secs(10),
            ..AutosaveConfig::default()
        },
    );

    let a = CanonicalPath::new(dir.path().join("a.txt")).unwrap();
    let b = CanonicalPath::new(dir.path().join("b.txt")).unwrap();
    let ticket_a = queue.schedule(a.clone(), "alpha".into(), SaveOptions::default());
    let ticket_b = queue.schedule(b.clone(), "beta".into(), SaveOptions::default());

    let results = queue.flush_all().await;
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|(_, outcome)| matches!(outcome, SaveOutcome::Written { .. })));

    assert!(matches!(ticket_a.wait().await, SaveOutcome::Written { .. }));
    assert!(matches!(ticket_b.wait().await, SaveOutcome::Written { .. }));
    assert_eq!(std::fs::read_to_string(a.as_path()).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(b.as_path()).unwrap(), "beta");
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    // Seed scenario: the write fails twice, then the retry succeeds. One
    // error diagnostic per failed attempt, and the final report is stats.
    let f = fixture(2, fast_config());

    let ticket = f
        .queue
        .schedule(f.path.clone(), "persisted".into(), SaveOptions::default());
    let outcome = ticket.wait().await;
    assert!(matches!(outcome, SaveOutcome::Written { .. }));

    assert_eq!(f.store.attempts(), 3);
    assert_eq!(f.sink.error_report_count(), 2);
    assert!(f.sink.last_report_is_stats());
    assert_eq!(
        std::fs::read_to_string(f.path.as_path()).unwrap(),
        "persisted"
    );
}

#[tokio::test]
async fn exhausted_retries_resolve_failed() {
    let f = fixture(10, fast_config());

    let ticket = f
        .queue
        .schedule(f.path.clone(), "doomed".into(), SaveOptions::default());
    match ticket.wait().await {
        SaveOutcome::Failed { last_message } => {
            assert!(last_message.contains("injected write failure"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Initial attempt plus max_retries.
    assert_eq!(f.store.attempts(), 1 + AutosaveConfig::default().max_retries);
    assert_eq!(
        f.sink.error_report_count() as u32,
        1 + AutosaveConfig::default().max_retries
    );
}

#[tokio::test]
async fn zero_retries_surfaces_first_error() {
    let f = fixture(10, fast_config());

    let ticket = f.queue.schedule(
        f.path.clone(),
        "doomed".into(),
        SaveOptions {
            max_retries: Some(0),
            ..SaveOptions::default()
        },
    );
    assert!(matches!(ticket.wait().await, SaveOutcome::Failed { .. }));
    assert_eq!(f.store.attempts(), 1);
}

#[tokio::test]
async fn backup_copies_prior_content_and_accumulates() {
    let f = fixture(0, fast_config());
    std::fs::write(f.path.as_path(), "original").unwrap();

    let options = SaveOptions {
        backup: Some(true),
        ..SaveOptions::default()
    };
    let outcome = f
        .queue
        .schedule(f.path.clone(), "updated".into(), options.clone())
        .wait()
        .await;
    assert!(matches!(outcome, SaveOutcome::Written { .. }));

    // Distinct timestamp for the second backup.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let outcome = f
        .queue
        .schedule(f.path.clone(), "updated again".into(), options)
        .wait()
        .await;
    assert!(matches!(outcome, SaveOutcome::Written { .. }));

    let parent = f.path.as_path().parent().unwrap();
    let mut backups: Vec<String> = std::fs::read_dir(parent)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".backup-"))
        .collect();
    backups.sort();
    assert_eq!(backups.len(), 2, "backups are never removed automatically");

    let first_backup = std::fs::read_to_string(parent.join(&backups[0])).unwrap();
    assert_eq!(first_backup, "original");
    let second_backup = std::fs::read_to_string(parent.join(&backups[1])).unwrap();
    assert_eq!(second_backup, "updated");
    assert_eq!(
        std::fs::read_to_string(f.path.as_path()).unwrap(),
        "updated again"
    );
}

#[tokio::test]
async fn missing_file_needs_no_backup() {
    let f = fixture(0, fast_config());
    let outcome = f
        .queue
        .schedule(
            f.path.clone(),
            "first version".into(),
            SaveOptions {
                backup: Some(true),
                ..SaveOptions::default()
            },
        )
        .wait()
        .await;
    assert!(matches!(outcome, SaveOutcome::Written { .. }));

    let parent = f.path.as_path().parent().unwrap();
    let backup_count = std::fs::read_dir(parent)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".backup-"))
        .count();
    assert_eq!(backup_count, 0);
}

#[tokio::test]
async fn write_now_skips_the_debounce_window() {
    let f = fixture(
        0,
        AutosaveConfig {
            debounce: Duration::from_secs(10),
            ..AutosaveConfig::default()
        },
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        f.queue
            .write_now(f.path.clone(), "immediate".into(), SaveOptions::default())
            .wait(),
    )
    .await
    .expect("write_now should not wait for the debounce window");
    assert!(matches!(outcome, SaveOutcome::Written { .. }));
    assert_eq!(
        std::fs::read_to_string(f.path.as_path()).unwrap(),
        "immediate"
    );
}
