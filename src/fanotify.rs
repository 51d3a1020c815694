//! fanotify backend for Linux kernels ≥ 5.9, running as root.
//!
//! fanotify with `FAN_REPORT_DFID_NAME` reports each event as a file handle
//! for the containing directory plus the entry name. The directory's current
//! path is recovered by opening the handle (`open_by_handle_at`) and reading
//! the `/proc/self/fd/<fd>` symlink; the entry name is appended to it. When
//! the handle cannot be resolved the event still carries the bare entry
//! name, so consumers must tolerate the occasional relative path.
//!
//! Unlike inotify, fanotify marks carry no descriptor the kernel hands back
//! on events, so the mark bookkeeping is a plain set of marked directory
//! paths, grown on directory creates and shrunk on destroys.

use crate::{emit, Event, EventHandler, Kind, Lifetime, SharedHandler, What};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use walkdir::WalkDir;

const FANOTIFY: Token = Token(0);
const DELAY: Duration = Duration::from_millis(16);
const MARK_RESERVE: usize = 1024;
const EVENT_BUF_LEN: usize = libc::PATH_MAX as usize;

// Group flags: notification class, directory-fid-with-name reporting, no
// queue or mark limits. The unlimited marks are what make this backend
// root-only.
const FAN_CLASS_NOTIF: libc::c_uint = 0x0000_0000;
const FAN_UNLIMITED_QUEUE: libc::c_uint = 0x0000_0010;
const FAN_UNLIMITED_MARKS: libc::c_uint = 0x0000_0020;
const FAN_REPORT_DIR_FID: libc::c_uint = 0x0000_0400;
const FAN_REPORT_NAME: libc::c_uint = 0x0000_0800;
const FAN_REPORT_DFID_NAME: libc::c_uint = FAN_REPORT_DIR_FID | FAN_REPORT_NAME;

const FAN_MARK_ADD: libc::c_uint = 0x0000_0001;
const FAN_MARK_REMOVE: libc::c_uint = 0x0000_0002;

const FAN_MODIFY: u64 = 0x0000_0002;
const FAN_MOVED_FROM: u64 = 0x0000_0040;
const FAN_MOVED_TO: u64 = 0x0000_0080;
const FAN_CREATE: u64 = 0x0000_0100;
const FAN_DELETE: u64 = 0x0000_0200;
const FAN_DELETE_SELF: u64 = 0x0000_0400;
const FAN_MOVE_SELF: u64 = 0x0000_0800;
const FAN_Q_OVERFLOW: u64 = 0x0000_4000;
const FAN_ONDIR: u64 = 0x4000_0000;
const FAN_MOVE: u64 = FAN_MOVED_FROM | FAN_MOVED_TO;

const MARK_MASK: u64 =
    FAN_ONDIR | FAN_CREATE | FAN_MODIFY | FAN_DELETE | FAN_MOVE | FAN_DELETE_SELF | FAN_MOVE_SELF;

const INIT_FLAGS: libc::c_uint =
    FAN_CLASS_NOTIF | FAN_REPORT_DFID_NAME | FAN_UNLIMITED_QUEUE | FAN_UNLIMITED_MARKS;
const INIT_EVENT_FLAGS: libc::c_uint =
    (libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC) as libc::c_uint;

const FAN_NOFD: i32 = -1;
const FANOTIFY_METADATA_VERSION: u8 = 3;
const FAN_EVENT_INFO_TYPE_DFID_NAME: u8 = 2;

/// `struct fanotify_event_metadata` from the kernel UAPI.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct EventMetadata {
    event_len: u32,
    vers: u8,
    reserved: u8,
    metadata_len: u16,
    mask: u64,
    fd: i32,
    pid: i32,
}

/// `struct fanotify_event_info_header` + the fsid of
/// `struct fanotify_event_info_fid`; the file handle follows in the buffer.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct EventInfoFid {
    info_type: u8,
    pad: u8,
    len: u16,
    fsid: [i32; 2],
}

/// The fixed head of `struct file_handle`; `f_handle` follows, then the
/// null-terminated entry name.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct FileHandleHead {
    handle_bytes: u32,
    handle_type: i32,
}

#[repr(C, align(8))]
struct EventBuffer([u8; EVENT_BUF_LEN]);

/// Whether this process can run the fanotify backend at all.
///
/// Being root is necessary but not sufficient: a container can withhold the
/// capabilities `fanotify_init` wants while leaving the euid 0, so the group
/// is probed rather than assumed.
pub(crate) fn usable() -> bool {
    if unsafe { libc::geteuid() } != 0 || !kernel_at_least(5, 9) {
        return false;
    }
    let fd = unsafe { libc::fanotify_init(INIT_FLAGS, INIT_EVENT_FLAGS) };
    if fd < 0 {
        return false;
    }
    unsafe { libc::close(fd) };
    true
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    let mut name: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return false;
    }
    let release = unsafe { CStr::from_ptr(name.release.as_ptr()) };
    match parse_release(&release.to_string_lossy()) {
        Some(version) => version >= (major, minor),
        None => false,
    }
}

/// Pulls `(major, minor)` out of a kernel release string like
/// `"6.1.0-13-amd64"`.
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn classify(mask: u64) -> (What, Kind) {
    let what = if mask & FAN_CREATE != 0 {
        What::Create
    } else if mask & FAN_DELETE != 0 {
        What::Destroy
    } else if mask & FAN_MODIFY != 0 {
        What::Modify
    } else if mask & FAN_MOVE != 0 {
        What::Rename
    } else {
        What::Other
    };
    let kind = if mask & FAN_ONDIR != 0 {
        Kind::Dir
    } else {
        Kind::File
    };
    (what, kind)
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

enum Drained {
    /// The descriptor ran dry, keep watching.
    Quiet,
    /// An unrecoverable error was reported; the watch must end.
    Dead,
}

struct Backend {
    poll: Poll,
    fanotify_fd: RawFd,
    marks: HashSet<PathBuf>,
}

impl Backend {
    fn open(path: &Path, handler: &Mutex<dyn EventHandler>) -> Option<Self> {
        let sys_error = |op: &str, err: io::Error| {
            log::warn!("{op} failed for {}: {err}", path.display());
            emit(
                handler,
                Event::new(
                    format!("e/sys/{op}@{}", path.display()),
                    What::Other,
                    Kind::Watcher,
                ),
            );
        };

        let fanotify_fd = unsafe { libc::fanotify_init(INIT_FLAGS, INIT_EVENT_FLAGS) };
        if fanotify_fd < 0 {
            sys_error("fanotify_init", io::Error::last_os_error());
            return None;
        }

        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                sys_error("epoll_create", err);
                unsafe { libc::close(fanotify_fd) };
                return None;
            }
        };

        if let Err(err) =
            poll.registry()
                .register(&mut SourceFd(&fanotify_fd), FANOTIFY, Interest::READABLE)
        {
            sys_error("epoll_ctl", err);
            unsafe { libc::close(fanotify_fd) };
            return None;
        }

        Some(Self {
            poll,
            fanotify_fd,
            marks: HashSet::with_capacity(MARK_RESERVE),
        })
    }

    fn mark(&mut self, dir: &Path) -> io::Result<()> {
        let cpath = cstring(dir)?;
        let rc = unsafe {
            libc::fanotify_mark(
                self.fanotify_fd,
                FAN_MARK_ADD,
                MARK_MASK,
                libc::AT_FDCWD,
                cpath.as_ptr(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        self.marks.insert(dir.to_path_buf());
        Ok(())
    }

    fn unmark(&mut self, dir: &Path) -> io::Result<()> {
        let cpath = cstring(dir)?;
        let rc = unsafe {
            libc::fanotify_mark(
                self.fanotify_fd,
                FAN_MARK_REMOVE,
                MARK_MASK,
                libc::AT_FDCWD,
                cpath.as_ptr(),
            )
        };
        self.marks.remove(dir);
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Marks the root and every directory below it. Follows symlinks, skips
    /// entries it cannot read. A subdirectory that cannot be marked is
    /// reported and skipped; a root that cannot be marked is an error.
    fn mark_tree(&mut self, root: &Path, handler: &Mutex<dyn EventHandler>) -> io::Result<()> {
        self.mark(root)?;

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
                if let Err(err) = self.mark(&dir) {
                    log::warn!("unable to mark {}: {err}", dir.display());
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

    /// Reads events until the descriptor runs dry, decoding and delivering
    /// each record.
    fn drain(&mut self, root: &Path, handler: &Mutex<dyn EventHandler>) -> Drained {
        let fatal = |op: &str| {
            emit(
                handler,
                Event::new(
                    format!("{op}@{}", root.display()),
                    What::Other,
                    Kind::Watcher,
                ),
            );
            Drained::Dead
        };

        let mut buf = EventBuffer([0; EVENT_BUF_LEN]);
        loop {
            let len = unsafe {
                libc::read(
                    self.fanotify_fd,
                    buf.0.as_mut_ptr() as *mut libc::c_void,
                    EVENT_BUF_LEN,
                )
            };

            if len == 0 {
                return Drained::Quiet;
            }
            if len < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Drained::Quiet;
                }
                log::warn!("fanotify read failed: {err}");
                return fatal("e/sys/read");
            }

            let len = len as usize;
            let mut offset = 0;
            while offset + mem::size_of::<EventMetadata>() <= len {
                // The buffer is 8-aligned and records are contiguous, but
                // an unaligned read keeps the decode independent of that.
                let metadata = unsafe {
                    (buf.0.as_ptr().add(offset) as *const EventMetadata).read_unaligned()
                };
                let record_len = metadata.event_len as usize;
                if record_len < mem::size_of::<EventMetadata>() || offset + record_len > len {
                    log::warn!("truncated fanotify record at offset {offset}");
                    return fatal("e/sys/read");
                }

                if metadata.fd != FAN_NOFD {
                    return fatal("e/sys/wrong_event_fd");
                }
                if metadata.vers != FANOTIFY_METADATA_VERSION {
                    return fatal("e/sys/kernel_version");
                }
                if metadata.mask & FAN_Q_OVERFLOW != 0 {
                    return fatal("e/sys/overflow");
                }

                let record = &buf.0[offset..offset + record_len];
                match decode_fid_record(record, &metadata) {
                    Some((path, what, kind)) => {
                        log::trace!(
                            "fanotify event: {} {what:?} {kind:?}",
                            path.display()
                        );
                        emit(handler, Event::new(path.clone(), what, kind));

                        // Keep the recursive guarantee. Failures here are
                        // deliberately silent; the event is already out.
                        if kind == Kind::Dir {
                            match what {
                                What::Create => {
                                    if let Err(err) = self.mark(&path) {
                                        log::debug!(
                                            "unable to mark new directory {}: {err}",
                                            path.display()
                                        );
                                    }
                                }
                                What::Destroy => {
                                    if let Err(err) = self.unmark(&path) {
                                        log::debug!(
                                            "unable to unmark directory {}: {err}",
                                            path.display()
                                        );
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    None => {
                        // An info record we did not ask for; drop the rest
                        // of this batch but keep the watch.
                        emit(
                            handler,
                            Event::new(
                                format!("w/self/event_info@{}", root.display()),
                                What::Other,
                                Kind::Watcher,
                            ),
                        );
                        return Drained::Quiet;
                    }
                }

                offset += record_len;
            }
        }
    }

    fn close(self) -> bool {
        // The epoll descriptor goes with `poll`; only the group descriptor
        // is ours to close.
        unsafe { libc::close(self.fanotify_fd) == 0 }
    }
}

/// Decodes one `FAN_EVENT_INFO_TYPE_DFID_NAME` record into a full path and
/// its classification. Returns `None` when the record carries some other
/// info type.
fn decode_fid_record(record: &[u8], metadata: &EventMetadata) -> Option<(PathBuf, What, Kind)> {
    let info_offset = metadata.metadata_len as usize;
    if info_offset + mem::size_of::<EventInfoFid>() > record.len() {
        return None;
    }
    let info = unsafe { (record.as_ptr().add(info_offset) as *const EventInfoFid).read_unaligned() };
    if info.info_type != FAN_EVENT_INFO_TYPE_DFID_NAME {
        return None;
    }

    let handle_offset = info_offset + mem::size_of::<EventInfoFid>();
    if handle_offset + mem::size_of::<FileHandleHead>() > record.len() {
        return None;
    }
    let handle = unsafe {
        (record.as_ptr().add(handle_offset) as *const FileHandleHead).read_unaligned()
    };

    // The entry name is a null-terminated string right after the opaque
    // handle bytes.
    let name_offset = handle_offset + mem::size_of::<FileHandleHead>() + handle.handle_bytes as usize;
    let name = record
        .get(name_offset..)
        .and_then(|tail| CStr::from_bytes_until_nul(tail).ok())
        .map(|name| name.to_bytes())
        .filter(|name| !name.is_empty() && *name != b".")
        .map(|name| PathBuf::from(std::ffi::OsString::from_vec(name.to_vec())));

    let (what, kind) = classify(metadata.mask);

    let dir = resolve_dir_handle(record, handle_offset);
    let path = match (dir, name) {
        (Some(dir), Some(name)) => dir.join(name),
        (Some(dir), None) => dir,
        // Handle resolution failed; the name is all we have.
        (None, Some(name)) => name,
        (None, None) => return None,
    };

    Some((path, what, kind))
}

/// Opens the directory's file handle and reads the path it currently has
/// from `/proc/self/fd`.
fn resolve_dir_handle(record: &[u8], handle_offset: usize) -> Option<PathBuf> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_open_by_handle_at,
            libc::AT_FDCWD,
            record.as_ptr().add(handle_offset),
            libc::O_RDONLY | libc::O_CLOEXEC | libc::O_PATH | libc::O_NONBLOCK,
        )
    } as RawFd;
    if fd < 0 {
        return None;
    }

    let dir = fs::read_link(format!("/proc/self/fd/{fd}")).ok();
    unsafe { libc::close(fd) };
    dir
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
    let mut backend = match Backend::open(path, handler) {
        Some(backend) => backend,
        None => {
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

    if let Err(err) = backend.mark_tree(path, handler) {
        log::warn!("unable to mark root {}: {err}", path.display());
        emit(
            handler,
            Event::new(
                format!("e/sys/fanotify_mark@{}", path.display()),
                What::Other,
                Kind::Watcher,
            ),
        );
        return die(backend, path, handler, false);
    }

    let mut events = Events::with_capacity(16);
    while lifetime.is_alive() {
        match backend.poll.poll(&mut events, Some(DELAY)) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("fanotify poll failed: {err}");
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
            if event.token() == FANOTIFY {
                if let Drained::Dead = backend.drain(path, handler) {
                    return die(backend, path, handler, false);
                }
            }
        }
    }

    die(backend, path, handler, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_strings_parse() {
        assert_eq!(parse_release("5.9.0"), Some((5, 9)));
        assert_eq!(parse_release("6.1.0-13-amd64"), Some((6, 1)));
        assert_eq!(parse_release("4.19.0-generic"), Some((4, 19)));
        assert_eq!(parse_release("mystery"), None);
    }

    #[test]
    fn version_comparison_is_lexicographic() {
        assert!((5, 9) >= (5, 9));
        assert!((5, 10) >= (5, 9));
        assert!((6, 0) >= (5, 9));
        assert!((5, 8) < (5, 9));
        assert!((4, 19) < (5, 9));
    }

    #[test]
    fn masks_classify_like_the_kernel_reports_them() {
        assert_eq!(classify(FAN_CREATE), (What::Create, Kind::File));
        assert_eq!(classify(FAN_CREATE | FAN_ONDIR), (What::Create, Kind::Dir));
        assert_eq!(classify(FAN_DELETE), (What::Destroy, Kind::File));
        assert_eq!(classify(FAN_MODIFY), (What::Modify, Kind::File));
        assert_eq!(classify(FAN_MOVED_FROM), (What::Rename, Kind::File));
        assert_eq!(classify(FAN_MOVED_TO | FAN_ONDIR), (What::Rename, Kind::Dir));
        assert_eq!(classify(FAN_MOVE_SELF), (What::Other, Kind::File));
    }

    #[test]
    fn decode_rejects_foreign_info_types() {
        // A metadata header followed by an info header of the wrong type.
        let metadata = EventMetadata {
            event_len: (mem::size_of::<EventMetadata>() + mem::size_of::<EventInfoFid>()) as u32,
            vers: FANOTIFY_METADATA_VERSION,
            reserved: 0,
            metadata_len: mem::size_of::<EventMetadata>() as u16,
            mask: FAN_CREATE,
            fd: FAN_NOFD,
            pid: 0,
        };
        let info = EventInfoFid {
            info_type: 1, // FID without a name
            pad: 0,
            len: mem::size_of::<EventInfoFid>() as u16,
            fsid: [0, 0],
        };

        let mut record = Vec::new();
        record.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                &metadata as *const _ as *const u8,
                mem::size_of::<EventMetadata>(),
            )
        });
        record.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&info as *const _ as *const u8, mem::size_of::<EventInfoFid>())
        });

        assert!(decode_fid_record(&record, &metadata).is_none());
    }
}
