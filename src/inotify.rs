//! inotify backend for Linux and Android.
//!
//! inotify watches are per-directory, so the recursive-watch guarantee is
//! built here: every directory under the root gets its own watch descriptor,
//! directories created while watching are registered as their create events
//! arrive, and destroyed directories are unregistered. The descriptor ↔ path
//! bookkeeping lives in two maps so events (keyed by descriptor) and
//! removals (keyed by path) are both cheap.

use crate::{emit, Event, EventHandler, Kind, Lifetime, SharedHandler, What};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use walkdir::WalkDir;

const INOTIFY: Token = Token(0);
const DELAY: Duration = Duration::from_millis(16);
const WATCH_RESERVE: usize = 256;

fn watch_mask() -> WatchMask {
    WatchMask::CREATE | WatchMask::MODIFY | WatchMask::DELETE | WatchMask::MOVED_FROM
}

struct Backend {
    poll: Poll,
    inotify: Inotify,
    /// Watch descriptor → the directory it watches.
    paths: HashMap<WatchDescriptor, PathBuf>,
    /// The reverse map, for unregistering destroyed directories.
    descriptors: HashMap<PathBuf, WatchDescriptor>,
}

impl Backend {
    fn open() -> io::Result<Self> {
        let inotify = Inotify::init()?;
        let poll = Poll::new()?;

        let fd = inotify.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), INOTIFY, Interest::READABLE)?;

        Ok(Self {
            poll,
            inotify,
            paths: HashMap::with_capacity(WATCH_RESERVE),
            descriptors: HashMap::with_capacity(WATCH_RESERVE),
        })
    }

    fn add_watch(&mut self, dir: &Path) -> io::Result<()> {
        let wd = self.inotify.watches().add(dir, watch_mask())?;
        self.paths.insert(wd.clone(), dir.to_path_buf());
        self.descriptors.insert(dir.to_path_buf(), wd);
        Ok(())
    }

    fn remove_watch(&mut self, dir: &Path) {
        if let Some(wd) = self.descriptors.remove(dir) {
            // The kernel drops the descriptor with the directory; an error
            // here just means it beat us to it.
            if let Err(err) = self.inotify.watches().remove(wd.clone()) {
                log::debug!("stale inotify descriptor for {}: {err}", dir.display());
            }
            self.paths.remove(&wd);
        }
    }

    /// Watches the root and, when it is a directory, every directory below
    /// it. Follows symlinks, skips entries it cannot read. A subdirectory
    /// that cannot be watched is reported and skipped; a root that cannot
    /// be watched is an error.
    fn add_watches_recursively(
        &mut self,
        root: &Path,
        handler: &Mutex<dyn EventHandler>,
    ) -> io::Result<()> {
        self.add_watch(root)?;

        if root.is_dir() {
            let subdirs: Vec<PathBuf> = WalkDir::new(root)
                .min_depth(1)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_dir())
                .map(|entry| entry.into_path())
                .collect();

            for dir in subdirs {
                if let Err(err) = self.add_watch(&dir) {
                    log::warn!("unable to watch {}: {err}", dir.display());
                    emit(
                        handler,
                        Event::new(
                            format!("w/sys/not_watched@{}@{}", root.display(), dir.display()),
                            What::Other,
                            Kind::Watcher,
                        ),
                    );
                }
            }
        }
        Ok(())
    }

    /// Reads events until the descriptor runs dry. Returns `false` on a
    /// fatal read error.
    fn drain(&mut self, root: &Path, handler: &Mutex<dyn EventHandler>) -> bool {
        let mut buffer = [0u8; 4096];
        loop {
            match self.inotify.read_events(&mut buffer) {
                Ok(events) => {
                    let mut pending = Vec::new();
                    let mut read = 0;
                    for event in events {
                        read += 1;
                        self.decode(event, root, handler, &mut pending);
                    }
                    for dir in pending {
                        if let Err(err) = self.add_watch(&dir) {
                            log::warn!("unable to watch {}: {err}", dir.display());
                            emit(
                                handler,
                                Event::new(
                                    format!(
                                        "w/sys/not_watched@{}@{}",
                                        root.display(),
                                        dir.display()
                                    ),
                                    What::Other,
                                    Kind::Watcher,
                                ),
                            );
                        }
                    }
                    if read == 0 {
                        return true;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) => {
                    log::warn!("inotify read failed: {err}");
                    emit(
                        handler,
                        Event::new(
                            format!("e/sys/read@{}", root.display()),
                            What::Other,
                            Kind::Watcher,
                        ),
                    );
                    return false;
                }
            }
        }
    }

    fn decode(
        &mut self,
        event: inotify::Event<&std::ffi::OsStr>,
        root: &Path,
        handler: &Mutex<dyn EventHandler>,
        pending_watches: &mut Vec<PathBuf>,
    ) {
        log::trace!("inotify event: {event:?}");

        if event.mask.contains(EventMask::Q_OVERFLOW) {
            emit(
                handler,
                Event::new(
                    format!("e/self/overflow@{}", root.display()),
                    What::Other,
                    Kind::Watcher,
                ),
            );
            return;
        }

        // Bookkeeping notices from the kernel, not filesystem changes.
        if event.mask.contains(EventMask::IGNORED) {
            return;
        }

        let dir = match self.paths.get(&event.wd) {
            Some(dir) => dir,
            None => {
                log::debug!("inotify event with unknown descriptor: {event:?}");
                return;
            }
        };
        let path = match event.name {
            Some(name) => dir.join(name),
            None => dir.clone(),
        };

        let kind = if event.mask.contains(EventMask::ISDIR) {
            Kind::Dir
        } else {
            Kind::File
        };
        let what = if event.mask.contains(EventMask::CREATE) {
            What::Create
        } else if event.mask.contains(EventMask::DELETE) {
            What::Destroy
        } else if event.mask.contains(EventMask::MOVED_FROM) {
            What::Rename
        } else if event.mask.contains(EventMask::MODIFY) {
            What::Modify
        } else {
            What::Other
        };

        emit(handler, Event::new(path.clone(), what, kind));

        // Keep the recursive guarantee: new directories are watched as
        // their create events arrive, destroyed ones unregistered.
        if kind == Kind::Dir {
            match what {
                What::Create => pending_watches.push(path),
                What::Destroy => self.remove_watch(&path),
                _ => {}
            }
        }
    }

    fn close(self) -> bool {
        self.inotify.close().is_ok()
    }
}

fn die(backend: Backend, root: &Path, handler: &Mutex<dyn EventHandler>, clean: bool) -> bool {
    let closed = backend.close();
    if clean && closed {
        emit(
            handler,
            Event::new(
                format!("s/self/die@{}", root.display()),
                What::Destroy,
                Kind::Watcher,
            ),
        );
        true
    } else {
        emit(
            handler,
            Event::new(
                format!("e/self/die@{}", root.display()),
                What::Destroy,
                Kind::Watcher,
            ),
        );
        false
    }
}

pub(crate) fn watch(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    let mut backend = match Backend::open() {
        Ok(backend) => backend,
        Err(err) => {
            log::warn!("inotify init failed: {err}");
            emit(
                handler,
                Event::new(
                    format!("e/sys/inotify_init@{}", path.display()),
                    What::Other,
                    Kind::Watcher,
                ),
            );
            emit(
                handler,
                Event::new(
                    format!("e/self/die@{}", path.display()),
                    What::Destroy,
                    Kind::Watcher,
                ),
            );
            return false;
        }
    };

    if let Err(err) = backend.add_watches_recursively(path, handler) {
        log::warn!("unable to watch root {}: {err}", path.display());
        emit(
            handler,
            Event::new(
                format!("e/self/path_map@{}", path.display()),
                What::Other,
                Kind::Watcher,
            ),
        );
        return die(backend, path, handler, false);
    }

    let mut events = Events::with_capacity(16);
    while lifetime.is_alive() {
        match backend.poll.poll(&mut events, Some(DELAY)) {
            // Interrupted by a signal; not an error worth dying over.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("inotify poll failed: {err}");
                emit(
                    handler,
                    Event::new(
                        format!("e/sys/epoll_wait@{}", path.display()),
                        What::Other,
                        Kind::Watcher,
                    ),
                );
                return die(backend, path, handler, false);
            }
            Ok(()) => {}
        }

        for event in events.iter() {
            if event.token() == INOTIFY && !backend.drain(path, handler) {
                return die(backend, path, handler, false);
            }
        }
    }

    die(backend, path, handler, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};

    fn shared_channel() -> (SharedHandler, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Mutex::new(tx)), rx)
    }

    #[test]
    fn recursive_registration_covers_every_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = a.join("b");
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(dir.path().join("file"), "").unwrap();

        let (handler, rx) = shared_channel();
        let mut backend = Backend::open().unwrap();
        backend
            .add_watches_recursively(dir.path(), &handler)
            .unwrap();

        // Root plus both nested directories; the file gets no descriptor.
        assert_eq!(backend.paths.len(), 3);
        assert!(backend.descriptors.contains_key(dir.path()));
        assert!(backend.descriptors.contains_key(&a));
        assert!(backend.descriptors.contains_key(&b));
        assert!(rx.try_recv().is_err(), "no warnings expected");
    }

    #[test]
    fn remove_watch_clears_both_maps() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let (handler, _rx) = shared_channel();
        let mut backend = Backend::open().unwrap();
        backend
            .add_watches_recursively(dir.path(), &handler)
            .unwrap();
        assert_eq!(backend.paths.len(), 2);

        backend.remove_watch(&sub);
        assert_eq!(backend.paths.len(), 1);
        assert_eq!(backend.descriptors.len(), 1);
        assert!(!backend.descriptors.contains_key(&sub));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nonesuch");

        let (handler, _rx) = shared_channel();
        let mut backend = Backend::open().unwrap();

        assert!(backend.add_watches_recursively(&root, &handler).is_err());
    }

    #[test]
    fn drain_reports_a_create_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, rx) = shared_channel();
        let mut backend = Backend::open().unwrap();
        backend
            .add_watches_recursively(dir.path(), &handler)
            .unwrap();

        let file = dir.path().join("fresh");
        std::fs::write(&file, "").unwrap();

        // Give the kernel a moment to queue the events, then drain.
        std::thread::sleep(Duration::from_millis(50));
        assert!(backend.drain(dir.path(), &handler));

        let events: Vec<Event> = rx.try_iter().collect();
        assert!(
            events
                .iter()
                .any(|ev| ev.path == file && ev.what == What::Create && ev.kind == Kind::File),
            "no create for {}: {events:?}",
            file.display()
        );
    }
}
