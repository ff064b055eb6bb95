//! End-to-end scenarios: a host engine and a view session joined by the
//! bridge, over a real filesystem and real timers.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tether::autosave::AutosaveConfig;
use tether::bridge::{self, BridgeConfig};
use tether::diagnostics::MemorySink;
use tether::engine::{Engine, EngineConfig};
use tether::session::{
    spawn_session, ConflictChoice, SessionConfig, SessionHandle, SessionState, UiEvent,
};
use tether::watch::{EventFilter, WatchConfig, WatchHandle, WatchRegistration};
use tether_types::{CanonicalPath, ChangeType};
use tokio::sync::mpsc;

const UI_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    engine: Engine,
    _watch: WatchHandle,
    session: SessionHandle,
    ui_rx: mpsc::UnboundedReceiver<UiEvent>,
    path: CanonicalPath,
}

fn fast_autosave() -> AutosaveConfig {
    AutosaveConfig {
        debounce: Duration::from_millis(40),
        ..AutosaveConfig::default()
    }
}

async fn setup(initial: &str, session_config: SessionConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("doc.md");
    std::fs::write(&file, initial).unwrap();
    let path = CanonicalPath::new(&file).unwrap();

    let (host, view) = bridge::pair(BridgeConfig::default());
    let sink = Arc::new(MemorySink::new());
    let config = EngineConfig {
        autosave: fast_autosave(),
        watch: WatchConfig {
            debounce: Duration::from_millis(30),
            tag_expiry: Duration::from_secs(5),
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, sink, host).await;
    let watch = engine
        .watch(WatchRegistration {
            root: dir.path().to_path_buf(),
            pattern: None,
            ignore: vec![".tether.lock".to_string()],
            events: EventFilter::default(),
            debounce: Duration::from_millis(30),
        })
        .unwrap();

    let (session, ui_rx) = spawn_session(path.clone(), view, session_config).await;

    Harness {
        _dir: dir,
        engine,
        _watch: watch,
        session,
        ui_rx,
        path,
    }
}

async fn wait_ui<F>(rx: &mut mpsc::UnboundedReceiver<UiEvent>, what: &str, pred: F) -> UiEvent
where
    F: Fn(&UiEvent) -> bool,
{
    tokio::time::timeout(UI_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("ui channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_for_initial_load(h: &mut Harness, expected: &str) {
    let event = wait_ui(&mut h.ui_rx, "initial load", |e| {
        matches!(e, UiEvent::BufferReplaced { .. })
    })
    .await;
    match event {
        UiEvent::BufferReplaced { content } => assert_eq!(content, expected),
        _ => unreachable!(),
    }
}

async fn wait_for_disk_content(path: &CanonicalPath, expected: &str) {
    let deadline = tokio::time::Instant::now() + UI_TIMEOUT;
    loop {
        let on_disk = std::fs::read_to_string(path.as_path()).unwrap_or_default();
        if on_disk == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {expected:?} on disk, found {on_disk:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn drain_quiet(rx: &mut mpsc::UnboundedReceiver<UiEvent>, quiet: Duration) -> Vec<UiEvent> {
    tokio::time::sleep(quiet).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn is_saving(event: &UiEvent) -> bool {
    matches!(
        event,
        UiEvent::StateChanged {
            state: SessionState::Saving,
            ..
        }
    )
}

fn is_clean(event: &UiEvent) -> bool {
    matches!(
        event,
        UiEvent::StateChanged {
            state: SessionState::Clean,
            dirty: false,
        }
    )
}

#[tokio::test]
async fn happy_save_round_trip() {
    // Seed scenario 1: one edit, one write, state returns to clean.
    let mut h = setup(
        "hello",
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            autosave_debounce: Duration::from_millis(50),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "hello").await;

    h.session.edit("hello!");
    wait_ui(&mut h.ui_rx, "saving state", is_saving).await;
    wait_ui(&mut h.ui_rx, "clean state", is_clean).await;

    assert_eq!(std::fs::read_to_string(h.path.as_path()).unwrap(), "hello!");

    // The save echo must not come back as a conflict or a buffer replacement.
    let rest = drain_quiet(&mut h.ui_rx, Duration::from_millis(600)).await;
    assert!(
        !rest.iter().any(|e| matches!(
            e,
            UiEvent::ConflictPresented { .. } | UiEvent::BufferReplaced { .. }
        )),
        "echo leaked back into the session: {rest:?}"
    );
}

#[tokio::test]
async fn typing_during_save_is_never_reverted() {
    // Seed scenario 2: the user keeps typing while a save is in flight; the
    // echo updates bookkeeping only and the newer keystrokes survive.
    let mut h = setup(
        "hello",
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            autosave_debounce: Duration::from_millis(40),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "hello").await;

    h.session.edit("hello!");
    wait_ui(&mut h.ui_rx, "saving state", is_saving).await;
    // Type one more character while the first save is (likely) in flight.
    h.session.edit("hello!?");

    // Eventually both saves land and the newer text is on disk.
    wait_for_disk_content(&h.path, "hello!?").await;

    let rest = drain_quiet(&mut h.ui_rx, Duration::from_millis(400)).await;
    assert!(
        !rest.iter().any(|e| matches!(
            e,
            UiEvent::ConflictPresented { .. } | UiEvent::BufferReplaced { .. }
        )),
        "save echo clobbered or conflicted the buffer: {rest:?}"
    );
}

#[tokio::test]
async fn external_change_with_unsaved_edits_presents_conflict() {
    // Seed scenario 3, ending with accept-external.
    let mut h = setup(
        "a",
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            // Long enough that the dirty buffer is not saved underneath the
            // external change.
            autosave_debounce: Duration::from_secs(10),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "a").await;

    h.session.edit("abc");
    // Let the editing-idle window pass: the user has stopped typing.
    tokio::time::sleep(Duration::from_millis(150)).await;

    std::fs::write(h.path.as_path(), "xyz").unwrap();

    let event = wait_ui(&mut h.ui_rx, "conflict", |e| {
        matches!(e, UiEvent::ConflictPresented { .. })
    })
    .await;
    match event {
        UiEvent::ConflictPresented { local, external } => {
            assert_eq!(local, "abc");
            assert_eq!(external, "xyz");
        }
        _ => unreachable!(),
    }

    h.session.resolve(ConflictChoice::AcceptExternal);
    let event = wait_ui(&mut h.ui_rx, "buffer replaced", |e| {
        matches!(e, UiEvent::BufferReplaced { .. })
    })
    .await;
    match event {
        UiEvent::BufferReplaced { content } => assert_eq!(content, "xyz"),
        _ => unreachable!(),
    }
    wait_ui(&mut h.ui_rx, "clean state", is_clean).await;
    assert_eq!(std::fs::read_to_string(h.path.as_path()).unwrap(), "xyz");
}

#[tokio::test]
async fn keep_local_saves_buffer_and_suppresses_its_echo() {
    // Seed scenario 4: resolve with keep-local; the buffer is written out
    // and its echo does not re-open the conflict.
    let mut h = setup(
        "a",
        SessionConfig {
            editing_idle: Duration::from_millis(150),
            autosave_debounce: Duration::from_millis(400),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "a").await;

    h.session.edit("abc");
    // External write lands inside the editing-idle window; the conflict is
    // deferred, then surfaces on idle.
    tokio::time::sleep(Duration::from_millis(10)).await;
    std::fs::write(h.path.as_path(), "xyz").unwrap();

    wait_ui(&mut h.ui_rx, "conflict", |e| {
        matches!(e, UiEvent::ConflictPresented { .. })
    })
    .await;

    h.session.resolve(ConflictChoice::KeepLocal);
    wait_for_disk_content(&h.path, "abc").await;

    let rest = drain_quiet(&mut h.ui_rx, Duration::from_millis(600)).await;
    assert!(
        !rest
            .iter()
            .any(|e| matches!(e, UiEvent::ConflictPresented { .. })),
        "echo of the keep-local save re-opened the conflict: {rest:?}"
    );
}

#[tokio::test]
async fn rapid_edits_collapse_to_one_save() {
    // Seed scenario 5: a burst of edits produces exactly one write carrying
    // the final content.
    let mut h = setup(
        "start",
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            autosave_debounce: Duration::from_millis(100),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "start").await;

    for i in 0..100 {
        h.session.edit(format!("edit {i}"));
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    wait_for_disk_content(&h.path, "edit 99").await;

    let events = drain_quiet(&mut h.ui_rx, Duration::from_millis(400)).await;
    let saves = events.iter().filter(|e| is_saving(e)).count();
    assert_eq!(saves, 1, "burst produced more than one save: {events:?}");
}

#[tokio::test]
async fn external_delete_surfaces_to_the_ui() {
    let mut h = setup(
        "here today",
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            autosave_debounce: Duration::from_millis(50),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "here today").await;

    std::fs::remove_file(h.path.as_path()).unwrap();

    let event = wait_ui(&mut h.ui_rx, "external delete", |e| {
        matches!(e, UiEvent::ExternalChange { .. })
    })
    .await;
    match event {
        UiEvent::ExternalChange { change_type } => assert_eq!(change_type, ChangeType::Delete),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn theme_and_state_payloads_pass_through_opaquely() {
    let mut h = setup(
        "doc",
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            autosave_debounce: Duration::from_millis(50),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "doc").await;

    let theme = serde_json::json!({"name": "midnight", "accent": "#7af"});
    h.engine.push_theme(Some(theme.clone())).unwrap();
    let event = wait_ui(&mut h.ui_rx, "theme push", |e| {
        matches!(e, UiEvent::ThemeChanged(_))
    })
    .await;
    match event {
        UiEvent::ThemeChanged(payload) => assert_eq!(payload, Some(theme)),
        _ => unreachable!(),
    }

    let blob = serde_json::json!({"scroll": 120, "cursor": [3, 14]});
    h.engine.push_state_restore(Some(blob.clone())).unwrap();
    let event = wait_ui(&mut h.ui_rx, "state restore push", |e| {
        matches!(e, UiEvent::StateRestore(_))
    })
    .await;
    match event {
        UiEvent::StateRestore(payload) => assert_eq!(payload, Some(blob)),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn missing_file_loads_as_new_empty_document() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("brand-new.md");
    let path = CanonicalPath::new(&file).unwrap();

    let (host, view) = bridge::pair(BridgeConfig::default());
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(
        EngineConfig {
            autosave: fast_autosave(),
            ..EngineConfig::default()
        },
        sink,
        host,
    )
    .await;

    let (session, mut ui_rx) = spawn_session(
        path.clone(),
        view,
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            autosave_debounce: Duration::from_millis(40),
        },
    )
    .await;

    // New-document path: loads empty rather than failing.
    let event = wait_ui(&mut ui_rx, "empty initial load", |e| {
        matches!(e, UiEvent::BufferReplaced { .. })
    })
    .await;
    match event {
        UiEvent::BufferReplaced { content } => assert_eq!(content, ""),
        _ => unreachable!(),
    }

    // The first save creates the file.
    session.edit("first words");
    wait_for_disk_content(&path, "first words").await;

    drop(engine);
    session.close().await;
}

#[tokio::test]
async fn session_close_waits_for_inflight_save() {
    let mut h = setup(
        "hello",
        SessionConfig {
            editing_idle: Duration::from_millis(50),
            autosave_debounce: Duration::from_millis(40),
        },
    )
    .await;
    wait_for_initial_load(&mut h, "hello").await;

    h.session.edit("parting words");
    wait_ui(&mut h.ui_rx, "saving state", is_saving).await;

    // Closing mid-save must wait for the write rather than abandon it.
    h.session.close().await;
    assert_eq!(
        std::fs::read_to_string(h.path.as_path()).unwrap(),
        "parting words"
    );
}
