//! Cross-platform filesystem event watcher.
//!
//! Watching a path delivers an [`Event`] to your handler for every creation,
//! modification, rename and removal under that path — recursively, including
//! directories created after the watch began — until you close the watch.
//!
//! One uniform event model is presented over four kernel interfaces and a
//! userspace fallback:
//!
//! - fanotify on Linux ≥ 5.9 when running with effective UID 0
//! - inotify on other Linux systems and on Android
//! - FSEvents on macOS
//! - `ReadDirectoryChangesW` on Windows
//! - a recursive polling scan everywhere else, or anywhere when the
//!   `force_polling` feature is enabled
//!
//! # Example
//!
//! ```no_run
//! let w = vigil::watch(".", |event: vigil::Event| {
//!     println!("{event}");
//! });
//!
//! // ... let it run ...
//!
//! let clean = w.close();
//! assert!(clean);
//! ```
//!
//! # Lifecycle
//!
//! [`watch`] emits a `s/self/live@<path>` meta-event synchronously, before it
//! returns, and spawns one worker thread that runs the platform backend. The
//! worker checks a shared liveness flag at least every ~16 ms.
//! [`Watch::close`] flips the flag, joins the worker and returns `true` when
//! the watch ended cleanly; a second call returns `false`. A terminal
//! `s/self/die@<path>` (or `e/self/die...` on failure) meta-event is the last
//! event the handler sees.
//!
//! Errors never escape the worker as panics or results: every failure is
//! surfaced to the handler as a meta-event with [`Kind::Watcher`]. See the
//! [`event`] module for the message grammar.
//!
//! # Features
//!
//! - `serde` — `Serialize`/`Deserialize` on the event types
//! - `crossbeam-channel` — [`EventHandler`] for `crossbeam_channel::Sender`
//! - `force_polling` — always use the polling backend

#![deny(missing_docs)]

pub use event::{Event, Kind, What};

use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub mod event;

#[cfg(all(target_os = "linux", not(feature = "force_polling")))]
mod fanotify;
#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(feature = "force_polling")
))]
mod inotify;
#[cfg(all(target_os = "macos", not(feature = "force_polling")))]
mod fsevent;
#[cfg(all(windows, not(feature = "force_polling")))]
mod windows;
#[cfg(any(
    test,
    feature = "force_polling",
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        windows
    ))
))]
mod poll;

/// The requirements for a watch's event handling function.
///
/// A handler is invoked synchronously by the watch's worker, one event at a
/// time. It must not call [`Watch::close`] on its own watch; doing so would
/// deadlock the join.
pub trait EventHandler: Send + 'static {
    /// Handles an event.
    fn handle_event(&mut self, event: Event);
}

impl<F> EventHandler for F
where
    F: FnMut(Event) + Send + 'static,
{
    fn handle_event(&mut self, event: Event) {
        (self)(event);
    }
}

impl EventHandler for std::sync::mpsc::Sender<Event> {
    fn handle_event(&mut self, event: Event) {
        let _ = self.send(event);
    }
}

#[cfg(feature = "crossbeam-channel")]
impl EventHandler for crossbeam_channel::Sender<Event> {
    fn handle_event(&mut self, event: Event) {
        let _ = self.send(event);
    }
}

/// The handler as shared with the worker: one stable reference per watch,
/// locked around each delivery.
pub(crate) type SharedHandler = Arc<Mutex<dyn EventHandler>>;

pub(crate) fn emit(handler: &Mutex<dyn EventHandler>, event: Event) {
    log::trace!("event: {event}");
    if let Ok(mut guard) = handler.lock() {
        guard.handle_event(event);
    }
}

/// The one datum shared between the caller and the worker.
pub(crate) struct Lifetime {
    closed: Mutex<bool>,
}

impl Lifetime {
    fn new() -> Self {
        Self {
            closed: Mutex::new(false),
        }
    }

    /// The liveness predicate. Workers poll this between suspensions.
    pub(crate) fn is_alive(&self) -> bool {
        !*self.closed.lock().unwrap()
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

/// A handle to a running watch.
///
/// Owns the worker. [`Watch::close`] is the only blocking operation of the
/// API. Dropping an unclosed handle detaches the worker without joining it.
pub struct Watch {
    lifetime: Arc<Lifetime>,
    worker: Mutex<Option<JoinHandle<bool>>>,
}

impl Watch {
    /// Stops the watch and waits for its worker to finish.
    ///
    /// Returns the worker's success status: `true` when the watch ended
    /// cleanly, `false` when it died on an error. Every call after the first
    /// returns `false`.
    pub fn close(&self) -> bool {
        let mut worker = self.worker.lock().unwrap();
        match worker.take() {
            Some(handle) => {
                self.lifetime.close();
                handle.join().unwrap_or(false)
            }
            None => false,
        }
    }
}

/// Watches `path` and all paths beneath it, delivering events to `handler`.
///
/// Emits `s/self/live@<path>` to `handler` before returning. Relative paths
/// are resolved against the current directory, so every content event
/// carries an absolute path.
pub fn watch<P, F>(path: P, handler: F) -> Watch
where
    P: Into<PathBuf>,
    F: EventHandler,
{
    let path = absolute(path.into());
    let root = path.display().to_string();
    let handler: SharedHandler = Arc::new(Mutex::new(handler));
    let lifetime = Arc::new(Lifetime::new());

    emit(
        &handler,
        Event::new(format!("s/self/live@{root}"), What::Create, Kind::Watcher),
    );

    let worker = {
        let handler = handler.clone();
        let lifetime = lifetime.clone();
        thread::Builder::new()
            .name("vigil watch loop".to_string())
            .spawn(move || run_backend(&path, &handler, &lifetime))
    };

    let worker = match worker {
        Ok(handle) => Some(handle),
        Err(err) => {
            log::warn!("unable to spawn watch worker: {err}");
            emit(
                &handler,
                Event::new(
                    format!("e/self/sys_resource@{root}"),
                    What::Other,
                    Kind::Watcher,
                ),
            );
            emit(
                &handler,
                Event::new(format!("e/self/die@{root}"), What::Destroy, Kind::Watcher),
            );
            None
        }
    };

    Watch {
        lifetime,
        worker: Mutex::new(worker),
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path,
        }
    }
}

/// Runs the backend selected for this platform until `lifetime` says stop.
///
/// On Linux the choice between fanotify and inotify is made here, at
/// runtime: fanotify needs an effective UID of 0 and a kernel that reports
/// directory file handles with names (5.9).
#[cfg(all(target_os = "linux", not(feature = "force_polling")))]
fn run_backend(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    if fanotify::usable() {
        fanotify::watch(path, handler, lifetime)
    } else {
        inotify::watch(path, handler, lifetime)
    }
}

#[cfg(all(target_os = "android", not(feature = "force_polling")))]
fn run_backend(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    inotify::watch(path, handler, lifetime)
}

#[cfg(all(target_os = "macos", not(feature = "force_polling")))]
fn run_backend(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    fsevent::watch(path, handler, lifetime)
}

#[cfg(all(windows, not(feature = "force_polling")))]
fn run_backend(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    windows::watch(path, handler, lifetime)
}

#[cfg(any(
    feature = "force_polling",
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        windows
    ))
))]
fn run_backend(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    poll::watch(path, handler, lifetime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn live_event_arrives_before_watch_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();

        let w = watch(dir.path(), tx);

        // No sleep: the live event is synchronous with `watch`.
        let first = rx.try_recv().expect("live event pending");
        assert_eq!(first.kind, Kind::Watcher);
        assert_eq!(first.what, What::Create);
        assert_eq!(
            first.path,
            PathBuf::from(format!("s/self/live@{}", dir.path().display()))
        );

        w.close();
    }

    #[test]
    fn close_twice_returns_false_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(dir.path(), |_: Event| {});

        std::thread::sleep(Duration::from_millis(50));

        assert!(w.close());
        assert!(!w.close());
        assert!(!w.close());
    }

    #[test]
    fn die_event_is_last_and_matches_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();

        let w = watch(dir.path(), tx);
        std::thread::sleep(Duration::from_millis(50));
        assert!(w.close());

        let events: Vec<Event> = rx.try_iter().collect();
        let last = events.last().expect("at least live and die");
        assert_eq!(last.kind, Kind::Watcher);
        let message = last.path.to_string_lossy().into_owned();
        assert!(
            message.starts_with("s/self/die@") || message.starts_with("e/self/die"),
            "unexpected terminal event: {message}"
        );
    }

    #[test]
    fn relative_roots_are_absolutized_in_the_live_event() {
        let (tx, rx) = mpsc::channel();
        let w = watch(".", tx);

        let first = rx.try_recv().expect("live event pending");
        let message = first.path.to_string_lossy().into_owned();
        let root = message.strip_prefix("s/self/live@").expect("live prefix");
        assert!(Path::new(root).is_absolute(), "root not absolute: {root}");

        w.close();
    }
}
