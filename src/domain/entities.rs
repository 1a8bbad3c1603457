//! Domain Entities - Core replication objects
//!
//! Snapshot entries, change events and the keys used for echo suppression.
//! They have no I/O and contain only replication logic.

use crate::domain::value_objects::RelPath;
use serde::{Deserialize, Serialize};

/// Kind of a replica entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }
}

/// One item of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub path: RelPath,
    pub kind: EntryKind,
    /// Size in bytes, files only
    pub size: Option<u64>,
}

impl FsEntry {
    pub fn file(path: RelPath, size: u64) -> Self {
        Self {
            path,
            kind: EntryKind::File,
            size: Some(size),
        }
    }

    pub fn directory(path: RelPath) -> Self {
        Self {
            path,
            kind: EntryKind::Directory,
            size: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Kind of a filesystem mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    DirAdded,
    DirDeleted,
    /// `path` moved to `new_path`
    Renamed,
    /// Permission bits changed; `mode` holds the new bits
    ModeChanged,
}

impl ChangeKind {
    /// Echo-suppression family of this kind.
    pub fn family(&self) -> OpFamily {
        match self {
            Self::Added | Self::Modified => OpFamily::Write,
            Self::Deleted | Self::DirDeleted => OpFamily::Delete,
            Self::DirAdded => OpFamily::Mkdir,
            Self::Renamed => OpFamily::Rename,
            Self::ModeChanged => OpFamily::Chmod,
        }
    }
}

/// A single mutation, observed locally or received from a peer.
///
/// Consumed once by whoever applies or forwards it; never queued for retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: RelPath,
    pub new_path: Option<RelPath>,
    pub payload: Option<Vec<u8>>,
    pub mode: Option<u32>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: RelPath) -> Self {
        Self {
            kind,
            path,
            new_path: None,
            payload: None,
            mode: None,
        }
    }

    pub fn renamed(from: RelPath, to: RelPath) -> Self {
        Self {
            new_path: Some(to),
            ..Self::new(ChangeKind::Renamed, from)
        }
    }

    pub fn mode_changed(path: RelPath, mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Self::new(ChangeKind::ModeChanged, path)
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Key under which this event is checked against the ledger.
    pub fn operation_key(&self) -> OperationKey {
        OperationKey::new(self.kind.family(), self.path.clone())
    }
}

/// Collapsed operation kind used for echo suppression and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFamily {
    Write,
    Delete,
    Mkdir,
    Rename,
    Chmod,
}

impl OpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Mkdir => "mkdir",
            Self::Rename => "rename",
            Self::Chmod => "chmod",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            "mkdir" => Some(Self::Mkdir),
            "rename" => Some(Self::Rename),
            "chmod" => Some(Self::Chmod),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Echo-suppression identity: `(family, path)`.
///
/// Two different writes to the same path share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub family: OpFamily,
    pub path: RelPath,
}

impl OperationKey {
    pub fn new(family: OpFamily, path: RelPath) -> Self {
        Self { family, path }
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.family, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> RelPath {
        RelPath::parse(s).unwrap()
    }

    #[test]
    fn test_family_collapse() {
        assert_eq!(ChangeKind::Added.family(), OpFamily::Write);
        assert_eq!(ChangeKind::Modified.family(), OpFamily::Write);
        assert_eq!(ChangeKind::Deleted.family(), OpFamily::Delete);
        assert_eq!(ChangeKind::DirDeleted.family(), OpFamily::Delete);
        assert_eq!(ChangeKind::DirAdded.family(), OpFamily::Mkdir);
        assert_eq!(ChangeKind::ModeChanged.family(), OpFamily::Chmod);
        assert_eq!(ChangeKind::Renamed.family(), OpFamily::Rename);
    }

    #[test]
    fn test_added_and_modified_share_a_key() {
        let a = ChangeEvent::new(ChangeKind::Added, p("a.txt")).operation_key();
        let m = ChangeEvent::new(ChangeKind::Modified, p("a.txt")).operation_key();
        assert_eq!(a, m);
        assert_eq!(a.to_string(), "write:a.txt");
    }

    #[test]
    fn test_op_family_round_trip_names() {
        for family in [
            OpFamily::Write,
            OpFamily::Delete,
            OpFamily::Mkdir,
            OpFamily::Rename,
            OpFamily::Chmod,
        ] {
            assert_eq!(OpFamily::from_str(family.as_str()), Some(family));
        }
        assert_eq!(OpFamily::from_str("truncate"), None);
    }

    #[test]
    fn test_event_builders() {
        let e = ChangeEvent::renamed(p("a"), p("b"));
        assert_eq!(e.kind, ChangeKind::Renamed);
        assert_eq!(e.new_path, Some(p("b")));

        let e = ChangeEvent::mode_changed(p("a"), 0o755);
        assert_eq!(e.mode, Some(0o755));

        let e = ChangeEvent::new(ChangeKind::Added, p("a")).with_payload(b"hi".to_vec());
        assert_eq!(e.payload.as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn test_fs_entry_constructors() {
        let f = FsEntry::file(p("a.txt"), 5);
        assert!(!f.is_dir());
        assert_eq!(f.size, Some(5));

        let d = FsEntry::directory(p("docs"));
        assert!(d.is_dir());
        assert_eq!(d.size, None);
        assert_eq!(d.kind.as_str(), "directory");
    }
}
