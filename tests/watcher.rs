//! End-to-end lifecycle scenarios, run against whichever backend the host
//! platform selects.
//!
//! Filesystem mutations are paced the way the watcher's own latency works:
//! the backends poll their liveness flag every ~16 ms, so a short settle
//! after mutating and before closing lets every queued kernel event reach
//! the handler. Assertions ignore event timestamps and, where noted, allow
//! platform-specific extras (e.g. directory-modified notices on Windows)
//! around the sequence under test.

use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::thread::sleep;
use std::time::Duration;
use vigil::{watch, Event, Kind, Watch, What};

/// Grace period for backend startup and for queued events to drain.
const SETTLE: Duration = Duration::from_millis(100);
/// Pacing between filesystem mutations.
#[cfg(not(feature = "force_polling"))]
const PACE: Duration = Duration::from_millis(10);

fn watched(root: &Path) -> (Watch, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel();
    let w = watch(root, tx);
    sleep(SETTLE);
    (w, rx)
}

fn close_and_collect(w: Watch, rx: mpsc::Receiver<Event>) -> Vec<Event> {
    sleep(SETTLE);
    assert!(w.close(), "watch should end cleanly");
    rx.try_iter().collect()
}

/// The live event leads, exactly one terminal event trails, and every
/// non-meta path in between is absolute.
fn assert_bracketed(events: &[Event], root: &Path) {
    let first = events.first().expect("no events at all");
    assert_eq!(first.kind, Kind::Watcher);
    assert_eq!(first.what, What::Create);
    assert_eq!(
        first.path.to_string_lossy(),
        format!("s/self/live@{}", root.display())
    );

    let last = events.last().expect("no terminal event");
    assert_eq!(last.kind, Kind::Watcher);
    let message = last.path.to_string_lossy().into_owned();
    assert!(
        message.starts_with("s/self/die@") || message.starts_with("e/self/die"),
        "unexpected terminal event: {message}"
    );

    let terminal_count = events
        .iter()
        .filter(|ev| {
            let m = ev.path.to_string_lossy().into_owned();
            m.starts_with("s/self/die@") || m.starts_with("e/self/die")
        })
        .count();
    assert_eq!(terminal_count, 1, "exactly one terminal event");

    for ev in events {
        if ev.kind != Kind::Watcher {
            assert!(
                ev.path.is_absolute(),
                "content event with relative path: {ev:?}"
            );
        }
    }
}

fn content(events: &[Event]) -> Vec<&Event> {
    events.iter().filter(|ev| ev.kind != Kind::Watcher).collect()
}

#[test]
fn empty_watch_sees_only_live_and_die() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (w, rx) = watched(dir.path());

    sleep(Duration::from_millis(50));

    let events = close_and_collect(w, rx);
    assert_bracketed(&events, dir.path());
    assert!(
        content(&events).is_empty(),
        "expected no content events: {events:?}"
    );
}

#[test]
fn single_file_create_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (w, rx) = watched(dir.path());

    let file = dir.path().join("a.txt");
    fs::File::create(&file).expect("create");

    let events = close_and_collect(w, rx);
    assert_bracketed(&events, dir.path());
    assert!(
        content(&events)
            .iter()
            .any(|ev| ev.path == file && ev.what == What::Create && ev.kind == Kind::File),
        "no file create for {}: {events:?}",
        file.display()
    );
}

#[test]
fn modify_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("settled.txt");
    fs::write(&file, "before").expect("seed file");

    let (w, rx) = watched(dir.path());
    fs::write(&file, "after, and longer than before").expect("rewrite");

    let events = close_and_collect(w, rx);
    assert_bracketed(&events, dir.path());
    assert!(
        content(&events)
            .iter()
            .any(|ev| ev.path == file && ev.what == What::Modify && ev.kind == Kind::File),
        "no modify for {}: {events:?}",
        file.display()
    );
}

#[test]
fn rename_surfaces_on_either_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let old = dir.path().join("a");
    let new = dir.path().join("b");
    fs::write(&old, "x").expect("seed file");

    let (w, rx) = watched(dir.path());
    fs::rename(&old, &new).expect("rename");

    let events = close_and_collect(w, rx);
    assert_bracketed(&events, dir.path());

    let renamed = content(&events)
        .iter()
        .any(|ev| ev.what == What::Rename && (ev.path == old || ev.path == new));
    // The polling backend cannot see renames as such; it reports the old
    // name destroyed and the new one created.
    let destroyed_and_created = content(&events)
        .iter()
        .any(|ev| ev.path == old && ev.what == What::Destroy)
        && content(&events)
            .iter()
            .any(|ev| ev.path == new && ev.what == What::Create);

    assert!(
        renamed || destroyed_and_created,
        "rename not reported either way: {events:?}"
    );
}

#[test]
fn create_then_delete_pairs_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (w, rx) = watched(dir.path());

    let file = dir.path().join("short-lived");
    fs::write(&file, "x").expect("create");
    sleep(SETTLE);
    fs::remove_file(&file).expect("remove");

    let events = close_and_collect(w, rx);
    assert_bracketed(&events, dir.path());

    let creates = content(&events)
        .iter()
        .filter(|ev| ev.path == file && ev.what == What::Create)
        .count();
    let destroys = content(&events)
        .iter()
        .filter(|ev| ev.path == file && ev.what == What::Destroy)
        .count();
    assert_eq!(creates, 1, "one create for {}: {events:?}", file.display());
    assert_eq!(destroys, 1, "one destroy for {}: {events:?}", file.display());
}

// The recursive-watch guarantee holds only for the kernel-backed adapters;
// the polling fallback reports files, not directories.
#[cfg(not(feature = "force_polling"))]
#[test]
fn new_subdirectory_and_child_are_reported_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (w, rx) = watched(dir.path());

    let subdir = dir.path().join("d");
    let child = subdir.join("f");
    fs::create_dir(&subdir).expect("create dir");
    sleep(PACE);
    fs::write(&child, "").expect("create child");

    let events = close_and_collect(w, rx);
    assert_bracketed(&events, dir.path());

    let creates: Vec<_> = content(&events)
        .into_iter()
        .filter(|ev| ev.what == What::Create)
        .collect();
    let dir_at = creates
        .iter()
        .position(|ev| ev.path == subdir && ev.kind == Kind::Dir);
    let child_at = creates
        .iter()
        .position(|ev| ev.path == child && ev.kind == Kind::File);

    match (dir_at, child_at) {
        (Some(d), Some(f)) => assert!(d < f, "child created before its directory: {events:?}"),
        _ => panic!(
            "missing create for {} or {}: {events:?}",
            subdir.display(),
            child.display()
        ),
    }
}

#[cfg(not(feature = "force_polling"))]
#[test]
fn ten_subdirectories_each_with_a_file_arrive_in_input_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (w, rx) = watched(dir.path());

    let mut expected = Vec::new();
    for i in 0..10 {
        let subdir = dir.path().join(format!("dir{i}"));
        fs::create_dir(&subdir).expect("create dir");
        expected.push((subdir.clone(), Kind::Dir));
        sleep(PACE);

        let file = subdir.join("file.txt");
        fs::write(&file, "").expect("create file");
        expected.push((file, Kind::File));
        sleep(PACE);
    }

    let events = close_and_collect(w, rx);
    assert_bracketed(&events, dir.path());

    let creates: Vec<_> = content(&events)
        .into_iter()
        .filter(|ev| ev.what == What::Create)
        .map(|ev| (ev.path.clone(), ev.kind))
        .collect();

    assert_eq!(creates, expected, "all events: {events:?}");
}
