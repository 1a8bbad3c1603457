//! Directory Snapshot Builder
//!
//! Full pre-order walk of a replica root. Directories are always listed
//! before their descendants, so replaying a snapshot as create operations
//! never needs a parent that does not exist yet.

use crate::domain::entities::FsEntry;
use crate::domain::value_objects::RelPath;
use std::path::{Path, PathBuf};

struct Pending {
    abs: PathBuf,
    rel: RelPath,
}

/// Enumerate every non-hidden entry under `root`.
///
/// Siblings are sorted by name. A directory that vanishes or cannot be read
/// mid-walk is skipped; the walk itself never fails. Symlinks are skipped.
pub async fn snapshot(root: &Path) -> Vec<FsEntry> {
    walk(root, root).await
}

/// Enumerate the descendants of `dir` (not `dir` itself).
pub async fn snapshot_subtree(root: &Path, dir: &RelPath) -> Vec<FsEntry> {
    walk(root, &dir.to_fs_path(root)).await
}

async fn walk(root: &Path, start: &Path) -> Vec<FsEntry> {
    let mut out = Vec::new();
    let mut stack = list_children(root, start).await;
    stack.reverse();

    while let Some(item) = stack.pop() {
        let meta = match tokio::fs::symlink_metadata(&item.abs).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!("snapshot skipping {}: {}", item.rel, e);
                continue;
            }
        };

        if meta.is_dir() {
            out.push(FsEntry::directory(item.rel));
            let mut children = list_children(root, &item.abs).await;
            children.reverse();
            stack.extend(children);
        } else if meta.is_file() {
            out.push(FsEntry::file(item.rel, meta.len()));
        } else {
            tracing::trace!("snapshot skipping non-regular entry {}", item.rel);
        }
    }

    out
}

async fn list_children(root: &Path, dir: &Path) -> Vec<Pending> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) => {
            tracing::debug!("snapshot cannot read {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut children = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("snapshot listing of {:?} interrupted: {}", dir, e);
                break;
            }
        };

        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let abs = entry.path();
        if let Ok(rel) = RelPath::from_fs(root, &abs) {
            children.push(Pending { abs, rel });
        }
    }

    children.sort_by(|a, b| a.rel.file_name().cmp(b.rel.file_name()));
    children
}
