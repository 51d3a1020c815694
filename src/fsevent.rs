//! FSEvents backend for Darwin.
//!
//! A file-level event stream over the root is scheduled on its own run-loop
//! thread; the kernel invokes the stream callback there with batches of
//! paths and flag words while the watch worker sleeps in 16 ms increments
//! polling the liveness predicate.
//!
//! FSEvents sometimes replays an already-delivered event alongside a newer
//! one for the same path (a create resent together with the destroy that
//! followed it). The stream context carries a set of paths whose create has
//! been delivered but not yet matched by a destroy: a create is suppressed
//! while its path is in the set, a destroy is suppressed unless it is, and
//! delivering the destroy removes it so a later re-creation reports again.

#![allow(non_upper_case_globals)]

use crate::{emit, Event, Kind, Lifetime, SharedHandler, What};
use objc2_core_foundation as cf;
use objc2_core_services as fs;
use std::collections::HashSet;
use std::ffi::CStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const DELAY: Duration = Duration::from_millis(16);

bitflags::bitflags! {
    #[repr(C)]
    #[derive(Clone, Copy, Debug)]
    struct StreamFlags: u32 {
        const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
        const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
        const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
        const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
        const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
        const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
        const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
        const IS_HARDLINK = fs::kFSEventStreamEventFlagItemIsHardlink;
        const IS_LAST_HARDLINK = fs::kFSEventStreamEventFlagItemIsLastHardlink;
    }
}

impl StreamFlags {
    /// A single path has a single kind, checked in this priority.
    fn kind(self) -> Kind {
        if self.contains(StreamFlags::IS_FILE) {
            Kind::File
        } else if self.contains(StreamFlags::IS_DIR) {
            Kind::Dir
        } else if self.contains(StreamFlags::IS_SYMLINK) {
            Kind::SymLink
        } else if self.intersects(StreamFlags::IS_HARDLINK | StreamFlags::IS_LAST_HARDLINK) {
            Kind::HardLink
        } else {
            Kind::Other
        }
    }
}

/// Owned by the stream; freed by `release_context` when the stream is
/// deallocated.
struct StreamContext {
    handler: SharedHandler,
    seen_created: Mutex<HashSet<PathBuf>>,
}

// Free the context when the stream created by `FSEventStreamCreate` is
// released. The FSEventStreamContext documentation guarantees `release` is
// called exactly once, at stream deallocation.
unsafe extern "C-unwind" fn release_context(info: *const libc::c_void) {
    unsafe {
        drop(Box::from_raw(
            info as *const StreamContext as *mut StreamContext,
        ));
    }
}

unsafe extern "C-unwind" fn callback(
    _stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: NonNull<libc::c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    _event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    let event_paths = event_paths.as_ptr() as *const *const libc::c_char;
    let context = &*(info as *const StreamContext);

    for i in 0..num_events {
        let raw_path = CStr::from_ptr(*event_paths.add(i));
        if raw_path.to_bytes().is_empty() {
            continue;
        }
        let path = PathBuf::from(std::ffi::OsStr::from_bytes(raw_path.to_bytes()));

        let flags = StreamFlags::from_bits_truncate(*event_flags.as_ptr().add(i));
        log::trace!("fsevent: path = `{}`, flags = {flags:?}", path.display());

        let kind = flags.kind();
        let mut seen_created = context.seen_created.lock().unwrap();

        // More than one thing may have happened to the same path, so the
        // flag checks are independent, not exclusive.
        if flags.contains(StreamFlags::ITEM_CREATED) && seen_created.insert(path.clone()) {
            emit(&context.handler, Event::new(path.clone(), What::Create, kind));
        }
        if flags.contains(StreamFlags::ITEM_REMOVED) && seen_created.remove(&path) {
            emit(&context.handler, Event::new(path.clone(), What::Destroy, kind));
        }
        if flags.contains(StreamFlags::ITEM_MODIFIED) {
            emit(&context.handler, Event::new(path.clone(), What::Modify, kind));
        }
        if flags.contains(StreamFlags::ITEM_RENAMED) {
            emit(&context.handler, Event::new(path.clone(), What::Rename, kind));
        }
    }
}

// Wrappers to move CF types into the stream thread. CFRunLoops may be used
// from any thread per the CoreFoundation thread-safety notes; the stream
// reference is only touched from the thread it is scheduled on.
struct CFRunLoopSendWrapper(cf::CFRetained<cf::CFRunLoop>);
unsafe impl Send for CFRunLoopSendWrapper {}

struct FSEventStreamSendWrapper(fs::FSEventStreamRef);
unsafe impl Send for FSEventStreamSendWrapper {}

/// The stream and the thread draining it, constructed together and torn
/// down together.
struct Stream {
    runloop: cf::CFRetained<cf::CFRunLoop>,
    thread: thread::JoinHandle<()>,
}

impl Stream {
    fn open(path: &Path, context: Box<StreamContext>) -> io::Result<Self> {
        let paths = cf::CFMutableArray::<cf::CFString>::empty();
        let cf_path = cf::CFString::from_str(&path.to_string_lossy());
        paths.append(&cf_path);

        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: Box::into_raw(context) as *mut libc::c_void,
            retain: None,
            release: Some(release_context),
            copyDescription: None,
        };

        let stream = unsafe {
            fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                Some(callback),
                &stream_context as *const _ as *mut _,
                paths.as_opaque(),
                fs::kFSEventStreamEventIdSinceNow,
                0.0,
                fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer,
            )
        };

        let stream = FSEventStreamSendWrapper(stream);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = thread::Builder::new()
            .name("vigil fsevents loop".to_string())
            .spawn(move || {
                let stream = stream.0;

                unsafe {
                    let runloop = cf::CFRunLoop::current().expect("current runloop");

                    #[allow(deprecated)]
                    fs::FSEventStreamScheduleWithRunLoop(
                        stream,
                        &runloop,
                        cf::kCFRunLoopDefaultMode.expect("default runloop mode"),
                    );

                    if !fs::FSEventStreamStart(stream) {
                        fs::FSEventStreamInvalidate(stream);
                        fs::FSEventStreamRelease(stream);
                        let _ = ready_tx.send(Err(io::Error::new(
                            io::ErrorKind::Other,
                            "unable to start FSEvent stream",
                        )));
                        return;
                    }

                    let _ = ready_tx.send(Ok(CFRunLoopSendWrapper(runloop)));

                    // Runs until `Stream::close` stops this runloop.
                    cf::CFRunLoop::run();

                    fs::FSEventStreamStop(stream);
                    // Events may still be pending for a stopped stream and
                    // would invoke the callback during invalidation; purge
                    // them first.
                    let event_id = fs::FSEventsGetCurrentEventId();
                    let device = fs::FSEventStreamGetDeviceBeingWatched(stream);
                    fs::FSEventsPurgeEventsForDeviceUpToEventId(device, event_id);
                    fs::FSEventStreamInvalidate(stream);
                    fs::FSEventStreamRelease(stream);
                }
            })?;

        let runloop = ready_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "FSEvent stream thread died"))??;

        Ok(Self {
            runloop: runloop.0,
            thread,
        })
    }

    fn close(self) -> bool {
        while !self.runloop.is_waiting() {
            thread::yield_now();
        }
        self.runloop.stop();
        self.thread.join().is_ok()
    }
}

pub(crate) fn watch(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    let context = Box::new(StreamContext {
        handler: handler.clone(),
        seen_created: Mutex::new(HashSet::new()),
    });

    let stream = match Stream::open(path, context) {
        Ok(stream) => stream,
        Err(err) => {
            log::warn!("unable to open FSEvent stream for {}: {err}", path.display());
            emit(
                handler,
                Event::new(
                    format!("e/sys/fsevent_start@{}", path.display()),
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

    while lifetime.is_alive() {
        thread::sleep(DELAY);
    }

    let clean = stream.close();
    if clean {
        emit(
            handler,
            Event::new(
                format!("s/self/die@{}", path.display()),
                What::Destroy,
                Kind::Watcher,
            ),
        );
    } else {
        emit(
            handler,
            Event::new(
                format!("e/self/die@{}", path.display()),
                What::Destroy,
                Kind::Watcher,
            ),
        );
    }
    clean
}
