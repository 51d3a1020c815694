//! `ReadDirectoryChangesW` backend for Windows.
//!
//! One overlapped read at a time is kept outstanding against the root
//! directory handle, with completions collected from an I/O completion port
//! in 16 ms waits. Each completed buffer holds a chain of
//! `FILE_NOTIFY_INFORMATION` records; iteration is bounded by the byte count
//! the kernel reported and each record's `NextEntryOffset`.

use crate::{emit, Event, EventHandler, Kind, Lifetime, SharedHandler, What};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::Mutex;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{CreateEventW, ResetEvent};
use windows_sys::Win32::System::IO::{
    CancelIo, CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

const DELAY_MS: u32 = 16;
const EVENT_BUF_LEN: usize = 8192;

const NOTIFY_MASK: u32 = FILE_NOTIFY_CHANGE_SECURITY
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_LAST_ACCESS
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_FILE_NAME;

#[repr(C, align(4))]
struct EventBuffer([u8; EVENT_BUF_LEN]);

/// Every OS handle this backend needs, constructed together and released
/// together. The buffer and the OVERLAPPED are boxed so their addresses
/// stay stable for the kernel across the watch loop.
struct WatchEventProxy {
    valid: bool,
    path: PathBuf,
    dir_handle: HANDLE,
    completion_token: HANDLE,
    event_token: HANDLE,
    overlapped: Box<OVERLAPPED>,
    buf: Box<EventBuffer>,
    ready_len: u32,
}

impl WatchEventProxy {
    fn open(path: &Path) -> Option<Self> {
        let encoded_path: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();

        let dir_handle = unsafe {
            CreateFileW(
                encoded_path.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if dir_handle == INVALID_HANDLE_VALUE {
            return None;
        }

        let completion_token =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        if completion_token.is_null() {
            unsafe { CloseHandle(dir_handle) };
            return None;
        }

        let associated = unsafe {
            CreateIoCompletionPort(dir_handle, completion_token, dir_handle as usize, 1)
        };
        let event_token = unsafe { CreateEventW(ptr::null_mut(), 1, 0, ptr::null()) };
        if associated.is_null() || event_token.is_null() {
            unsafe {
                if !event_token.is_null() {
                    CloseHandle(event_token);
                }
                CloseHandle(completion_token);
                CloseHandle(dir_handle);
            }
            return None;
        }
        unsafe { ResetEvent(event_token) };

        Some(Self {
            valid: true,
            path: path.to_path_buf(),
            dir_handle,
            completion_token,
            event_token,
            overlapped: Box::new(unsafe { mem::zeroed() }),
            buf: Box::new(EventBuffer([0; EVENT_BUF_LEN])),
            ready_len: 0,
        })
    }

    /// Queues the next overlapped read over the whole subtree.
    fn issue_read(&mut self, handler: &Mutex<dyn EventHandler>) {
        self.ready_len = 0;
        *self.overlapped = unsafe { mem::zeroed() };
        let mut bytes_returned = 0u32;

        let read_ok = unsafe {
            ReadDirectoryChangesW(
                self.dir_handle,
                self.buf.0.as_mut_ptr() as *mut _,
                EVENT_BUF_LEN as u32,
                1,
                NOTIFY_MASK,
                &mut bytes_returned,
                self.overlapped.as_mut(),
                None,
            )
        };

        if read_ok != 0 {
            self.ready_len = bytes_returned;
            return;
        }

        self.valid = false;
        match unsafe { GetLastError() } {
            ERROR_IO_PENDING => {
                emit(
                    handler,
                    Event::new("e/sys/read/pending", What::Other, Kind::Watcher),
                );
            }
            err => {
                log::warn!("ReadDirectoryChangesW failed for {}: {err}", self.path.display());
                emit(handler, Event::new("e/sys/read", What::Other, Kind::Watcher));
            }
        }
    }

    fn has_event(&self) -> bool {
        self.ready_len != 0
    }

    /// Walks the completed buffer and delivers one event per record.
    fn deliver(&mut self, handler: &Mutex<dyn EventHandler>) {
        let len = self.ready_len as usize;
        let base = self.buf.0.as_ptr();
        let name_field = mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName);
        let mut offset = 0usize;

        while offset + mem::size_of::<FILE_NOTIFY_INFORMATION>() <= len {
            let record =
                unsafe { (base.add(offset) as *const FILE_NOTIFY_INFORMATION).read_unaligned() };

            // FileNameLength counts bytes of UTF-16; an odd count means the
            // record is not something we can decode.
            let name_bytes = record.FileNameLength as usize;
            if name_bytes % 2 != 0 || offset + name_field + name_bytes > len {
                log::warn!("malformed directory-change record at offset {offset}");
                break;
            }

            let wide = unsafe {
                slice::from_raw_parts(base.add(offset + name_field) as *const u16, name_bytes / 2)
            };
            let path = self.path.join(OsString::from_wide(wide));

            let what = match record.Action {
                FILE_ACTION_MODIFIED => What::Modify,
                FILE_ACTION_ADDED => What::Create,
                FILE_ACTION_REMOVED => What::Destroy,
                FILE_ACTION_RENAMED_OLD_NAME | FILE_ACTION_RENAMED_NEW_NAME => What::Rename,
                _ => What::Other,
            };

            // Removed paths resolve to NotFound, which is an answer, not an
            // error: they were not directories by the time we looked.
            let kind = match fs::metadata(&path) {
                Ok(metadata) if metadata.is_dir() => Kind::Dir,
                Ok(_) => Kind::File,
                Err(err) if err.kind() == io::ErrorKind::NotFound => Kind::File,
                Err(_) => Kind::Other,
            };

            log::trace!("directory change: {} {what:?} {kind:?}", path.display());
            emit(handler, Event::new(path, what, kind));

            if record.NextEntryOffset == 0 {
                break;
            }
            offset += record.NextEntryOffset as usize;
        }

        self.ready_len = 0;
    }
}

impl Drop for WatchEventProxy {
    fn drop(&mut self) {
        unsafe {
            // Cancel the outstanding read and let its aborted completion
            // drain before the buffer and OVERLAPPED go away.
            if self.dir_handle != INVALID_HANDLE_VALUE {
                CancelIo(self.dir_handle);
                let mut bytes = 0u32;
                let mut key = 0usize;
                let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
                GetQueuedCompletionStatus(
                    self.completion_token,
                    &mut bytes,
                    &mut key,
                    &mut overlapped,
                    DELAY_MS,
                );
                CloseHandle(self.dir_handle);
            }
            if !self.event_token.is_null() {
                CloseHandle(self.event_token);
            }
            if !self.completion_token.is_null() {
                CloseHandle(self.completion_token);
            }
        }
    }
}

pub(crate) fn watch(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    let mut proxy = match WatchEventProxy::open(path) {
        Some(proxy) => proxy,
        None => {
            log::warn!(
                "unable to open {} for directory changes: {}",
                path.display(),
                io::Error::last_os_error()
            );
            emit(
                handler,
                Event::new(
                    format!("e/self/sys_resource@{}", path.display()),
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

    proxy.issue_read(handler);
    while proxy.valid && proxy.has_event() {
        proxy.deliver(handler);
        proxy.issue_read(handler);
    }

    while lifetime.is_alive() && proxy.valid {
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

        let complete = unsafe {
            GetQueuedCompletionStatus(
                proxy.completion_token,
                &mut bytes,
                &mut key,
                &mut overlapped,
                DELAY_MS,
            )
        };

        if complete != 0 && !overlapped.is_null() {
            proxy.ready_len = bytes;
            while proxy.valid && proxy.has_event() {
                proxy.deliver(handler);
                proxy.issue_read(handler);
            }
        }
    }

    let clean = proxy.valid;
    drop(proxy);

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
