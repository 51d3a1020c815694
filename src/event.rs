//! The `Event` type: one record per filesystem change.
//!
//! Every backend normalizes into this shape. An event carries the affected
//! `path`, a classification of `what` happened and what `kind` of path it
//! happened to, and a nanosecond timestamp taken when the event was built.
//!
//! Events with [`Kind::Watcher`] are meta-events about the watcher itself.
//! Their `path` holds a structured message instead of a filesystem path:
//!
//! ```text
//! {severity}/{origin}/{op}[@{root}[@{subpath}]]
//! ```
//!
//! where severity is `s` (status), `w` (warning) or `e` (error), and origin
//! is `self` or `sys`. For example `s/self/live@/some/root` announces a
//! watcher coming up and `e/sys/epoll_wait@/some/root` a failed system call.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What happened to a path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum What {
    /// A path was given a new name.
    Rename,

    /// A path's contents were changed.
    Modify,

    /// A path came into existence.
    Create,

    /// A path ceased to exist.
    Destroy,

    /// A path's ownership was changed.
    Owner,

    /// Something else, or unknown.
    Other,
}

/// The kind of path an event is about.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Kind {
    /// A directory.
    Dir,

    /// A regular file.
    File,

    /// A hard link.
    HardLink,

    /// A symbolic link.
    SymLink,

    /// The watcher itself; the event is a meta-event.
    Watcher,

    /// Something else, or unknown.
    Other,
}

/// A single filesystem event.
///
/// Comparison is strict: two events are equal only if all four fields match,
/// the `when` timestamp included.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    /// The affected path. Absolute for content events; a structured message
    /// for meta-events (see the module docs).
    pub path: PathBuf,

    /// What happened.
    pub what: What,

    /// What kind of path it happened to.
    pub kind: Kind,

    /// Nanoseconds since the Unix epoch, captured at construction.
    ///
    /// Non-decreasing within a single watch; no ordering is defined across
    /// watches.
    pub when: i64,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new<P: Into<PathBuf>>(path: P, what: What, kind: Kind) -> Self {
        Self {
            path: path.into(),
            what,
            kind,
            when: now_nanos(),
        }
    }
}

fn now_nanos() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        // Clock before the epoch. Unlikely, but representable.
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

impl fmt::Display for What {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            What::Rename => "rename",
            What::Modify => "modify",
            What::Create => "create",
            What::Destroy => "destroy",
            What::Owner => "owner",
            What::Other => "other",
        };
        write!(f, "\"{name}\"")
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Dir => "dir",
            Kind::File => "file",
            Kind::HardLink => "hard_link",
            Kind::SymLink => "sym_link",
            Kind::Watcher => "watcher",
            Kind::Other => "other",
        };
        write!(f, "\"{name}\"")
    }
}

impl fmt::Display for Event {
    /// Renders the event as a JSON object member keyed by its timestamp:
    ///
    /// ```text
    /// "1678046920675963000":{"where":"/some/file.txt","what":"create","kind":"file"}
    /// ```
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\":{{\"where\":\"{}\",\"what\":{},\"kind\":{}}}",
            self.when,
            self.path.display(),
            self.what,
            self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_the_documented_grammar() {
        let ev = Event {
            path: PathBuf::from("/some/file.txt"),
            what: What::Create,
            kind: Kind::File,
            when: 1678046920675963000,
        };

        assert_eq!(
            ev.to_string(),
            r#""1678046920675963000":{"where":"/some/file.txt","what":"create","kind":"file"}"#
        );
    }

    #[test]
    fn display_round_trips_through_a_json_parser() {
        let ev = Event {
            path: PathBuf::from("/w/dir"),
            what: What::Destroy,
            kind: Kind::Dir,
            when: 42,
        };

        let parsed: serde_json::Value =
            serde_json::from_str(&format!("{{{ev}}}")).expect("valid json object");
        let body = parsed.get("42").expect("keyed by timestamp");

        assert_eq!(body["where"], "/w/dir");
        assert_eq!(body["what"], "destroy");
        assert_eq!(body["kind"], "dir");
    }

    #[test]
    fn wire_names_cover_every_variant() {
        let whats = [
            (What::Rename, "\"rename\""),
            (What::Modify, "\"modify\""),
            (What::Create, "\"create\""),
            (What::Destroy, "\"destroy\""),
            (What::Owner, "\"owner\""),
            (What::Other, "\"other\""),
        ];
        for (what, wire) in whats {
            assert_eq!(what.to_string(), wire);
        }

        let kinds = [
            (Kind::Dir, "\"dir\""),
            (Kind::File, "\"file\""),
            (Kind::HardLink, "\"hard_link\""),
            (Kind::SymLink, "\"sym_link\""),
            (Kind::Watcher, "\"watcher\""),
            (Kind::Other, "\"other\""),
        ];
        for (kind, wire) in kinds {
            assert_eq!(kind.to_string(), wire);
        }
    }

    #[test]
    fn equality_compares_all_fields_including_when() {
        let a = Event {
            path: PathBuf::from("/a"),
            what: What::Create,
            kind: Kind::File,
            when: 1,
        };
        let same = a.clone();
        let later = Event { when: 2, ..a.clone() };

        assert_eq!(a, same);
        assert_ne!(a, later);
    }

    #[test]
    fn new_stamps_a_plausible_timestamp() {
        let before = now_nanos();
        let ev = Event::new("/tmp/x", What::Modify, Kind::File);
        let after = now_nanos();

        assert!(ev.when >= before && ev.when <= after);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_uses_the_wire_names() {
        let ev = Event {
            path: PathBuf::from("/a/b"),
            what: What::Rename,
            kind: Kind::SymLink,
            when: 7,
        };
        let json = serde_json::to_string(&ev).unwrap();

        assert!(json.contains("\"rename\""));
        assert!(json.contains("\"sym_link\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
