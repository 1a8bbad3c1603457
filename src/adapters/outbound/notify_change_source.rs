//! Notify Change Source
//!
//! Implements ChangeSource on top of the `notify` crate's recommended
//! watcher and normalizes its platform-specific event kinds.

use crate::domain::entities::{ChangeEvent, ChangeKind, EntryKind};
use crate::domain::errors::SyncError;
use crate::domain::ports::{ChangeSource, WatchHandle};
use crate::domain::value_objects::RelPath;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;

/// Native recursive watcher (inotify, FSEvents, ReadDirectoryChangesW).
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyChangeSource;

impl NotifyChangeSource {
    pub fn new() -> Self {
        Self
    }
}

impl ChangeSource for NotifyChangeSource {
    fn watch(&self, root: &Path, events: mpsc::Sender<ChangeEvent>) -> Result<WatchHandle, SyncError> {
        let watch_err = |reason: String| SyncError::Watch {
            path: root.to_path_buf(),
            reason,
        };

        let root = root.canonicalize().map_err(|e| watch_err(e.to_string()))?;
        let cb_root = root.clone();

        // Runs on the watcher's own thread, outside the tokio runtime.
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate(&cb_root, &event) {
                    if events.blocking_send(change).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("watch error under {:?}: {}", cb_root, e);
            }
        })
        .map_err(|e| watch_err(e.to_string()))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| watch_err(e.to_string()))?;

        tracing::info!("watching {:?}", root);
        Ok(WatchHandle::new(watcher))
    }
}

/// Translate one raw notification into replica change events.
///
/// Hidden entries and the root itself are dropped. Where the platform does
/// not say whether a path is a file or a directory, the path is stat'ed.
pub fn translate(root: &Path, event: &Event) -> Vec<ChangeEvent> {
    let mut out = Vec::new();

    match &event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let Some(rel) = relative(root, path) else { continue };
                let entry_kind = match kind {
                    CreateKind::File => Some(EntryKind::File),
                    CreateKind::Folder => Some(EntryKind::Directory),
                    _ => stat_kind(path),
                };
                match entry_kind {
                    Some(EntryKind::File) => out.push(ChangeEvent::new(ChangeKind::Added, rel)),
                    Some(EntryKind::Directory) => out.push(ChangeEvent::new(ChangeKind::DirAdded, rel)),
                    None => {}
                }
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() >= 2 => {
                let from = &event.paths[0];
                let to = &event.paths[1];
                match (relative(root, from), relative(root, to)) {
                    (Some(f), Some(t)) => out.push(ChangeEvent::renamed(f, t)),
                    (None, Some(_)) => out.extend(appeared_or_vanished(root, to)),
                    (Some(f), None) => out.push(ChangeEvent::new(ChangeKind::Deleted, f)),
                    (None, None) => {}
                }
            }
            RenameMode::From => {
                for path in &event.paths {
                    if let Some(rel) = relative(root, path) {
                        out.push(ChangeEvent::new(ChangeKind::Deleted, rel));
                    }
                }
            }
            _ => {
                for path in &event.paths {
                    out.extend(appeared_or_vanished(root, path));
                }
            }
        },
        EventKind::Modify(_) => {
            for path in &event.paths {
                let Some(rel) = relative(root, path) else { continue };
                if stat_kind(path) == Some(EntryKind::File) {
                    out.push(ChangeEvent::new(ChangeKind::Modified, rel));
                }
            }
        }
        EventKind::Remove(kind) => {
            let change_kind = match kind {
                RemoveKind::Folder => ChangeKind::DirDeleted,
                _ => ChangeKind::Deleted,
            };
            for path in &event.paths {
                if let Some(rel) = relative(root, path) {
                    out.push(ChangeEvent::new(change_kind, rel));
                }
            }
        }
        _ => {}
    }

    out
}

fn relative(root: &Path, path: &Path) -> Option<RelPath> {
    let rel = RelPath::from_fs(root, path).ok()?;
    if rel.is_hidden() {
        None
    } else {
        Some(rel)
    }
}

fn stat_kind(path: &Path) -> Option<EntryKind> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.is_dir() {
        Some(EntryKind::Directory)
    } else if meta.is_file() {
        Some(EntryKind::File)
    } else {
        None
    }
}

fn appeared_or_vanished(root: &Path, path: &Path) -> Option<ChangeEvent> {
    let rel = relative(root, path)?;
    match stat_kind(path) {
        Some(EntryKind::File) => Some(ChangeEvent::new(ChangeKind::Added, rel)),
        Some(EntryKind::Directory) => Some(ChangeEvent::new(ChangeKind::DirAdded, rel)),
        None if std::fs::symlink_metadata(path).is_err() => {
            Some(ChangeEvent::new(ChangeKind::Deleted, rel))
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, MetadataKind};
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: Vec<std::path::PathBuf>) -> Event {
        let mut e = Event::new(kind);
        e.paths = paths;
        e
    }

    fn root() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        dir
    }

    #[test]
    fn test_create_file_and_folder() {
        let dir = root();
        let r = dir.path();

        let out = translate(r, &event(EventKind::Create(CreateKind::File), vec![r.join("a.txt")]));
        assert_eq!(out, vec![ChangeEvent::new(ChangeKind::Added, RelPath::parse("a.txt").unwrap())]);

        let out = translate(r, &event(EventKind::Create(CreateKind::Folder), vec![r.join("docs")]));
        assert_eq!(out[0].kind, ChangeKind::DirAdded);

        // Unknown kind resolved by stat
        let out = translate(r, &event(EventKind::Create(CreateKind::Any), vec![r.join("docs")]));
        assert_eq!(out[0].kind, ChangeKind::DirAdded);
    }

    #[test]
    fn test_hidden_and_root_are_dropped() {
        let dir = root();
        let r = dir.path();

        let out = translate(r, &event(EventKind::Create(CreateKind::File), vec![r.join(".swp")]));
        assert!(out.is_empty());

        let out = translate(r, &event(EventKind::Create(CreateKind::File), vec![r.join(".git/HEAD")]));
        assert!(out.is_empty());

        let out = translate(r, &event(EventKind::Create(CreateKind::Folder), vec![r.to_path_buf()]));
        assert!(out.is_empty());
    }

    #[test]
    fn test_modify_data_on_file_only() {
        let dir = root();
        let r = dir.path();
        let kind = EventKind::Modify(ModifyKind::Data(DataChange::Content));

        let out = translate(r, &event(kind, vec![r.join("a.txt")]));
        assert_eq!(out[0].kind, ChangeKind::Modified);

        let out = translate(r, &event(kind, vec![r.join("docs")]));
        assert!(out.is_empty());
    }

    #[test]
    fn test_metadata_is_ignored() {
        let dir = root();
        let r = dir.path();
        let kind = EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions));
        assert!(translate(r, &event(kind, vec![r.join("a.txt")])).is_empty());
    }

    #[test]
    fn test_rename_both() {
        let dir = root();
        let r = dir.path();
        let kind = EventKind::Modify(ModifyKind::Name(RenameMode::Both));

        let out = translate(r, &event(kind, vec![r.join("old.txt"), r.join("a.txt")]));
        assert_eq!(
            out,
            vec![ChangeEvent::renamed(
                RelPath::parse("old.txt").unwrap(),
                RelPath::parse("a.txt").unwrap()
            )]
        );
    }

    #[test]
    fn test_rename_from_hidden_temp_is_an_add() {
        let dir = root();
        let r = dir.path();
        let kind = EventKind::Modify(ModifyKind::Name(RenameMode::Both));

        let out = translate(r, &event(kind, vec![r.join(".a.txt.tmp"), r.join("a.txt")]));
        assert_eq!(out, vec![ChangeEvent::new(ChangeKind::Added, RelPath::parse("a.txt").unwrap())]);
    }

    #[test]
    fn test_rename_into_hidden_is_a_delete() {
        let dir = root();
        let r = dir.path();
        let kind = EventKind::Modify(ModifyKind::Name(RenameMode::Both));

        let out = translate(r, &event(kind, vec![r.join("gone.txt"), r.join(".trash")]));
        assert_eq!(out[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_rename_halves() {
        let dir = root();
        let r = dir.path();

        let from = EventKind::Modify(ModifyKind::Name(RenameMode::From));
        let out = translate(r, &event(from, vec![r.join("x.txt")]));
        assert_eq!(out[0].kind, ChangeKind::Deleted);

        let to = EventKind::Modify(ModifyKind::Name(RenameMode::To));
        let out = translate(r, &event(to, vec![r.join("a.txt")]));
        assert_eq!(out[0].kind, ChangeKind::Added);

        let any = EventKind::Modify(ModifyKind::Name(RenameMode::Any));
        let out = translate(r, &event(any, vec![r.join("vanished")]));
        assert_eq!(out[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_remove_kinds() {
        let dir = root();
        let r = dir.path();

        let out = translate(r, &event(EventKind::Remove(RemoveKind::Folder), vec![r.join("old")]));
        assert_eq!(out[0].kind, ChangeKind::DirDeleted);

        let out = translate(r, &event(EventKind::Remove(RemoveKind::Any), vec![r.join("old.txt")]));
        assert_eq!(out[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_watch_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let result = NotifyChangeSource::new().watch(&dir.path().join("missing"), tx);
        assert!(matches!(result, Err(SyncError::Watch { .. })));
    }

    #[tokio::test]
    async fn test_watch_reports_new_file() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let _handle = NotifyChangeSource::new().watch(dir.path(), tx).unwrap();

        std::fs::write(dir.path().join("new.txt"), b"data").unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if event.path.as_str() == "new.txt" {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found);
    }
}
