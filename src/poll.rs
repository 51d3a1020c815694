//! Polling backend: a recursive scan against a last-write-time bucket.
//!
//! The fallback for platforms without a native notification interface, also
//! selectable everywhere with the `force_polling` feature. Each tick tends
//! the bucket (populating it on first use), prunes entries whose paths have
//! vanished, then rescans the tree for new and changed regular files.
//!
//! Only file-level create/modify/destroy are distinguished; a rename
//! surfaces as a destroy of the old name and a create of the new one.

// On platforms with a native backend this module is only compiled for its
// tests, which exercise the tick functions rather than the watch loop.
#![cfg_attr(test, allow(dead_code))]

use crate::{emit, Event, EventHandler, Kind, Lifetime, SharedHandler, What};
use filetime::FileTime;
use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

const DELAY: Duration = Duration::from_millis(16);

/// One bucket entry. The kind is recorded at insertion so that a later
/// destroy reports what the path was, not what the root happens to be now.
struct PathData {
    mtime: FileTime,
    kind: Kind,
}

type Bucket = HashMap<PathBuf, PathData>;

fn kind_of(metadata: &Metadata) -> Kind {
    let ft = metadata.file_type();
    if ft.is_dir() {
        Kind::Dir
    } else if ft.is_file() {
        Kind::File
    } else if ft.is_symlink() {
        Kind::SymLink
    } else {
        Kind::Other
    }
}

/// Follow symlinks, skip whatever cannot be read.
fn walk(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
}

/// Fills an empty bucket from a full walk of the root, or prunes a
/// non-empty one. Fails only when the root itself is gone.
fn tend_bucket(root: &Path, handler: &Mutex<dyn EventHandler>, bucket: &mut Bucket) -> bool {
    if bucket.is_empty() {
        populate(root, bucket)
    } else {
        prune(handler, bucket);
        true
    }
}

fn populate(root: &Path, bucket: &mut Bucket) -> bool {
    let root_metadata = match fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(_) => return false,
    };

    if root_metadata.is_dir() {
        for entry in walk(root) {
            if let Ok(metadata) = entry.metadata() {
                bucket.insert(
                    entry.into_path(),
                    PathData {
                        mtime: FileTime::from_last_modification_time(&metadata),
                        kind: kind_of(&metadata),
                    },
                );
            }
        }
    } else {
        bucket.insert(
            root.to_path_buf(),
            PathData {
                mtime: FileTime::from_last_modification_time(&root_metadata),
                kind: kind_of(&root_metadata),
            },
        );
    }
    true
}

fn prune(handler: &Mutex<dyn EventHandler>, bucket: &mut Bucket) {
    let gone: Vec<PathBuf> = bucket
        .keys()
        .filter(|path| !path.exists())
        .cloned()
        .collect();

    for path in gone {
        if let Some(data) = bucket.remove(&path) {
            emit(handler, Event::new(path, What::Destroy, data.kind));
        }
    }
}

/// Rescans the tree: creates for unseen regular files, modifies on a
/// changed timestamp, destroys when the timestamp can no longer be read.
/// Fails only when the root itself cannot be scanned.
fn scan(root: &Path, handler: &Mutex<dyn EventHandler>, bucket: &mut Bucket) -> bool {
    match fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => {
            for entry in walk(root) {
                if entry.file_type().is_file() {
                    scan_file(entry.path(), handler, bucket);
                }
            }
            true
        }
        Ok(_) => {
            scan_file(root, handler, bucket);
            true
        }
        Err(_) => false,
    }
}

fn scan_file(path: &Path, handler: &Mutex<dyn EventHandler>, bucket: &mut Bucket) {
    let mtime = match fs::metadata(path) {
        Ok(metadata) => FileTime::from_last_modification_time(&metadata),
        Err(_) => {
            // The file changed under us mid-scan.
            if let Some(data) = bucket.remove(path) {
                emit(handler, Event::new(path, What::Destroy, data.kind));
            }
            return;
        }
    };

    match bucket.get_mut(path) {
        None => {
            bucket.insert(
                path.to_path_buf(),
                PathData {
                    mtime,
                    kind: Kind::File,
                },
            );
            emit(handler, Event::new(path, What::Create, Kind::File));
        }
        Some(data) if data.mtime != mtime => {
            data.mtime = mtime;
            emit(handler, Event::new(path, What::Modify, Kind::File));
        }
        Some(_) => {}
    }
}

pub(crate) fn watch(path: &Path, handler: &SharedHandler, lifetime: &Lifetime) -> bool {
    let mut bucket = Bucket::new();

    while lifetime.is_alive() {
        if !tend_bucket(path, handler, &mut bucket) || !scan(path, handler, &mut bucket) {
            log::debug!("polling root no longer scannable: {}", path.display());
            emit(
                handler,
                Event::new(
                    format!("e/self/die/bad_fs@{}", path.display()),
                    What::Destroy,
                    Kind::Watcher,
                ),
            );
            return false;
        }
        thread::sleep(DELAY);
    }

    emit(
        handler,
        Event::new(
            format!("s/self/die@{}", path.display()),
            What::Destroy,
            Kind::Watcher,
        ),
    );
    true
}
