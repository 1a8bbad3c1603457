//! Local Replica Adapter
//!
//! Filesystem operations on one replica root. Every path is a [`RelPath`]
//! resolved against the root, and no operation follows a symbolic link, so
//! nothing here can touch files outside it.

use crate::domain::entities::EntryKind;
use crate::domain::errors::SyncError;
use crate::domain::value_objects::RelPath;
use std::fs::{Metadata, Permissions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handle to a replica root directory.
#[derive(Debug, Clone)]
pub struct LocalReplica {
    root: Arc<PathBuf>,
}

impl LocalReplica {
    /// Open (creating if needed) a replica root and check it is writable.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SyncError> {
        let root = root.as_ref();
        let setup = |reason: String| SyncError::Setup {
            path: root.to_path_buf(),
            reason,
        };

        std::fs::create_dir_all(root).map_err(|e| setup(e.to_string()))?;
        let root = root.canonicalize().map_err(|e| setup(e.to_string()))?;

        let meta = std::fs::metadata(&root).map_err(|e| setup(e.to_string()))?;
        if !meta.is_dir() {
            return Err(setup("not a directory".to_string()));
        }

        // Hidden, so it never shows up in snapshots or watch events.
        let probe = root.join(format!(".edge-sync-probe-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&probe, b"").map_err(|e| setup(format!("not writable: {}", e)))?;
        let _ = std::fs::remove_file(&probe);

        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &RelPath) -> PathBuf {
        path.to_fs_path(&self.root)
    }

    /// Resolve `path`, refusing it when an existing ancestor is a symlink.
    ///
    /// The entry itself is not checked; callers stat it with
    /// `symlink_metadata` and treat a link as a plain entry.
    async fn confined(&self, path: &RelPath) -> io::Result<PathBuf> {
        for ancestor in path.ancestors() {
            if let Ok(meta) = tokio::fs::symlink_metadata(self.resolve(&ancestor)).await {
                if meta.file_type().is_symlink() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("{} is a symbolic link", ancestor),
                    ));
                }
            }
        }
        Ok(self.resolve(path))
    }

    /// Kind of the entry at `path`; symlinks and missing paths yield `None`.
    pub async fn kind_of(&self, path: &RelPath) -> Option<EntryKind> {
        let full = self.confined(path).await.ok()?;
        let meta = tokio::fs::symlink_metadata(full).await.ok()?;
        if meta.is_dir() {
            Some(EntryKind::Directory)
        } else if meta.is_file() {
            Some(EntryKind::File)
        } else {
            None
        }
    }

    /// Read a regular file.
    pub async fn read_file(&self, path: &RelPath) -> io::Result<Vec<u8>> {
        let full = self.confined(path).await?;
        let meta = tokio::fs::symlink_metadata(&full).await?;
        if !meta.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
        }
        tokio::fs::read(&full).await
    }

    /// Replace a file's content, creating parent directories.
    ///
    /// Bytes go to a hidden sibling first and are renamed into place, so a
    /// reader never sees a half-written file. An existing file keeps its
    /// permission bits.
    pub async fn write_file(&self, path: &RelPath, content: &[u8]) -> io::Result<()> {
        let full = self.confined(path).await?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "a directory exists at this path"));
            }
            // The link itself is replaced; its target keeps its bytes.
            Ok(meta) if meta.file_type().is_symlink() => None,
            Ok(meta) => Some(meta.permissions()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        let tmp = temp_sibling(&full, path.file_name());
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Some(perms) = existing {
            let _ = tokio::fs::set_permissions(&tmp, perms).await;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    /// Create a directory and its parents. Existing directories are fine.
    pub async fn ensure_dir(&self, path: &RelPath) -> io::Result<()> {
        let full = self.confined(path).await?;
        match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(io::Error::new(io::ErrorKind::AlreadyExists, "a file exists at this path")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => tokio::fs::create_dir_all(&full).await,
            Err(e) => Err(e),
        }
    }

    /// Remove a file or a directory tree.
    ///
    /// Returns `false` if nothing was there; a missing path is not an error.
    pub async fn remove(&self, path: &RelPath) -> io::Result<bool> {
        let full = self.confined(path).await?;
        let meta = match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            remove_tree(&full).await?;
        } else {
            ignore_not_found(tokio::fs::remove_file(&full).await)?;
        }
        Ok(true)
    }

    /// Move an entry. The source must exist.
    pub async fn rename(&self, from: &RelPath, to: &RelPath) -> io::Result<()> {
        let src = self.confined(from).await?;
        let dst = self.confined(to).await?;
        tokio::fs::symlink_metadata(&src).await?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await
    }

    pub async fn set_mode(&self, path: &RelPath, mode: u32) -> io::Result<()> {
        let full = self.confined(path).await?;
        let meta = not_a_link(tokio::fs::symlink_metadata(&full).await?)?;
        tokio::fs::set_permissions(&full, permissions_with_mode(&meta, mode)).await
    }

    pub async fn mode_of(&self, path: &RelPath) -> io::Result<u32> {
        let full = self.confined(path).await?;
        let meta = not_a_link(tokio::fs::symlink_metadata(&full).await?)?;
        Ok(mode_bits(&meta))
    }

    /// Ancestors of `path` that do not exist yet, outermost first.
    pub async fn missing_ancestors(&self, path: &RelPath) -> Vec<RelPath> {
        let mut missing = Vec::new();
        for ancestor in path.ancestors() {
            if tokio::fs::symlink_metadata(self.resolve(&ancestor)).await.is_ok() {
                break;
            }
            missing.push(ancestor);
        }
        missing.reverse();
        missing
    }
}

fn temp_sibling(full: &Path, name: &str) -> PathBuf {
    let tmp_name = format!(".{}.edge-sync-{}", name, uuid::Uuid::new_v4().simple());
    full.with_file_name(tmp_name)
}

fn not_a_link(meta: Metadata) -> io::Result<Metadata> {
    if meta.file_type().is_symlink() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "symbolic links are not replicated"));
    }
    Ok(meta)
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Delete a directory tree without recursion.
async fn remove_tree(dir: &Path) -> io::Result<()> {
    let mut stack = vec![dir.to_path_buf()];
    let mut dirs = Vec::new();

    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        dirs.push(current);

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                ignore_not_found(tokio::fs::remove_file(entry.path()).await)?;
            }
        }
    }

    // Children were pushed after their parents.
    for d in dirs.iter().rev() {
        ignore_not_found(tokio::fs::remove_dir(d).await)?;
    }
    Ok(())
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn permissions_with_mode(_meta: &Metadata, mode: u32) -> Permissions {
    use std::os::unix::fs::PermissionsExt;
    Permissions::from_mode(mode & 0o7777)
}

#[cfg(not(unix))]
fn permissions_with_mode(meta: &Metadata, mode: u32) -> Permissions {
    let mut perms = meta.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    perms
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(s: &str) -> RelPath {
        RelPath::parse(s).unwrap()
    }

    fn replica() -> (TempDir, LocalReplica) {
        let dir = TempDir::new().unwrap();
        let replica = LocalReplica::open(dir.path()).unwrap();
        (dir, replica)
    }

    #[test]
    fn test_open_creates_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("nested/root");
        let replica = LocalReplica::open(&root).unwrap();
        assert!(replica.root().is_dir());
        // Probe file is cleaned up
        assert_eq!(std::fs::read_dir(replica.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_open_rejects_file_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        let result = LocalReplica::open(&file);
        assert!(matches!(result, Err(SyncError::Setup { .. })));
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let (_dir, r) = replica();
        r.write_file(&p("a/b/c.txt"), b"hello").await.unwrap();

        assert_eq!(r.read_file(&p("a/b/c.txt")).await.unwrap(), b"hello");
        assert_eq!(r.kind_of(&p("a/b")).await, Some(EntryKind::Directory));
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let (_dir, r) = replica();
        r.write_file(&p("a.txt"), b"same").await.unwrap();
        r.write_file(&p("a.txt"), b"same").await.unwrap();

        assert_eq!(r.read_file(&p("a.txt")).await.unwrap(), b"same");
        // No temp files left behind
        let names: Vec<_> = std::fs::read_dir(r.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_write_over_directory_fails() {
        let (_dir, r) = replica();
        r.ensure_dir(&p("docs")).await.unwrap();
        assert!(r.write_file(&p("docs"), b"x").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_preserves_mode() {
        let (_dir, r) = replica();
        r.write_file(&p("run.sh"), b"#!/bin/sh").await.unwrap();
        r.set_mode(&p("run.sh"), 0o755).await.unwrap();

        r.write_file(&p("run.sh"), b"#!/bin/sh\necho hi").await.unwrap();
        assert_eq!(r.mode_of(&p("run.sh")).await.unwrap(), 0o755);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let (_dir, r) = replica();
        assert!(!r.remove(&p("ghost.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_tree() {
        let (_dir, r) = replica();
        r.write_file(&p("d/x/1.txt"), b"1").await.unwrap();
        r.write_file(&p("d/y/z/2.txt"), b"2").await.unwrap();
        r.write_file(&p("d/3.txt"), b"3").await.unwrap();

        assert!(r.remove(&p("d")).await.unwrap());
        assert_eq!(r.kind_of(&p("d")).await, None);
    }

    #[tokio::test]
    async fn test_read_directory_fails() {
        let (_dir, r) = replica();
        r.ensure_dir(&p("docs")).await.unwrap();
        assert!(r.read_file(&p("docs")).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_requires_source() {
        let (_dir, r) = replica();
        let err = r.rename(&p("nope"), &p("dst")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        r.write_file(&p("src.txt"), b"data").await.unwrap();
        r.rename(&p("src.txt"), &p("moved/dst.txt")).await.unwrap();
        assert_eq!(r.read_file(&p("moved/dst.txt")).await.unwrap(), b"data");
        assert_eq!(r.kind_of(&p("src.txt")).await, None);
    }

    #[tokio::test]
    async fn test_ensure_dir_over_file_fails() {
        let (_dir, r) = replica();
        r.write_file(&p("f"), b"x").await.unwrap();
        assert!(r.ensure_dir(&p("f")).await.is_err());
        r.ensure_dir(&p("g/h")).await.unwrap();
        r.ensure_dir(&p("g/h")).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_ancestors() {
        let (_dir, r) = replica();
        r.ensure_dir(&p("a")).await.unwrap();

        let missing = r.missing_ancestors(&p("a/b/c/file.txt")).await;
        assert_eq!(missing, vec![p("a/b"), p("a/b/c")]);
        assert!(r.missing_ancestors(&p("top.txt")).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_file_is_not_read() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"TOPSECRET").unwrap();
        let (dir, r) = replica();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link")).unwrap();

        assert!(r.read_file(&p("link")).await.is_err());
        assert!(r.mode_of(&p("link")).await.is_err());
        assert!(r.set_mode(&p("link"), 0o777).await.is_err());
        assert_eq!(r.kind_of(&p("link")).await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_dir_is_not_traversed() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("keep.txt"), b"keep").unwrap();
        let (dir, r) = replica();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("linkdir")).unwrap();

        let denied = r.write_file(&p("linkdir/x"), b"x").await.unwrap_err();
        assert_eq!(denied.kind(), io::ErrorKind::PermissionDenied);
        assert!(r.read_file(&p("linkdir/keep.txt")).await.is_err());
        assert!(r.ensure_dir(&p("linkdir/sub")).await.is_err());
        assert!(r.remove(&p("linkdir/keep.txt")).await.is_err());
        assert!(r.rename(&p("linkdir/keep.txt"), &p("stolen.txt")).await.is_err());

        assert!(!outside.path().join("x").exists());
        assert!(!outside.path().join("sub").exists());
        assert_eq!(std::fs::read(outside.path().join("keep.txt")).unwrap(), b"keep");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_over_symlink_replaces_link() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("target"), b"original").unwrap();
        let (dir, r) = replica();
        std::os::unix::fs::symlink(outside.path().join("target"), dir.path().join("link")).unwrap();

        r.write_file(&p("link"), b"replica").await.unwrap();
        assert_eq!(std::fs::read(outside.path().join("target")).unwrap(), b"original");
        assert_eq!(r.read_file(&p("link")).await.unwrap(), b"replica");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_set_and_read_mode() {
        let (_dir, r) = replica();
        r.write_file(&p("a.txt"), b"x").await.unwrap();
        r.set_mode(&p("a.txt"), 0o600).await.unwrap();
        assert_eq!(r.mode_of(&p("a.txt")).await.unwrap(), 0o600);
    }
}
