//! Initial-sync reconciliation
//!
//! Compares a local snapshot with the hub's and decides what the edge must
//! delete, create and fetch. Both snapshots are full; nothing is diffed
//! incrementally.

use crate::domain::entities::{EntryKind, FsEntry};
use crate::domain::value_objects::RelPath;
use std::collections::HashSet;

/// Work an edge performs to align with a hub snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Local entries absent from the hub, outermost first
    pub deletions: Vec<RelPath>,
    /// Hub directories to ensure, parents first
    pub directories: Vec<RelPath>,
    /// Hub files whose content must be queried
    pub fetches: Vec<RelPath>,
    /// Local-only entries left in place because they were asked to be kept
    pub retained: Vec<RelPath>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.directories.is_empty() && self.fetches.is_empty()
    }
}

/// Build the reconciliation plan.
///
/// Entries are compared on `(path, kind)`: a local file where the hub has a
/// directory of the same name is deleted and recreated as a directory.
/// Descendants of a deleted directory are not listed separately since the
/// directory is removed recursively.
///
/// Entries in `keep` are never deleted, nor are the directories holding
/// them; the rest of such a directory is deleted entry by entry.
pub fn plan(local: &[FsEntry], remote: &[FsEntry], keep: &HashSet<RelPath>) -> ReconcilePlan {
    let remote_set: HashSet<(&RelPath, EntryKind)> =
        remote.iter().map(|e| (&e.path, e.kind)).collect();
    let holding: HashSet<RelPath> = keep.iter().flat_map(|path| path.ancestors()).collect();

    let mut deleted_dirs: HashSet<&RelPath> = HashSet::new();
    let mut deletions = Vec::new();
    let mut retained = Vec::new();

    for entry in local {
        if remote_set.contains(&(&entry.path, entry.kind)) {
            continue;
        }
        let covered = entry
            .path
            .ancestors()
            .iter()
            .any(|a| deleted_dirs.contains(a));
        if covered {
            continue;
        }
        if keep.contains(&entry.path) {
            retained.push(entry.path.clone());
            continue;
        }
        if holding.contains(&entry.path) {
            continue;
        }
        if entry.is_dir() {
            deleted_dirs.insert(&entry.path);
        }
        deletions.push(entry.path.clone());
    }

    let mut directories = Vec::new();
    let mut fetches = Vec::new();
    for entry in remote {
        match entry.kind {
            EntryKind::Directory => directories.push(entry.path.clone()),
            EntryKind::File => fetches.push(entry.path.clone()),
        }
    }

    ReconcilePlan {
        deletions,
        directories,
        fetches,
        retained,
    }
}
