//! Remote Change Applier
//!
//! Applies peer-originated mutations to the local replica. Every mutation
//! registers its operation key first, so the change source's report of the
//! same write is recognized as an echo.

use crate::adapters::outbound::LocalReplica;
use crate::domain::entities::{EntryKind, OpFamily, OperationKey};
use crate::domain::errors::SyncError;
use crate::domain::services::OperationLedger;
use crate::domain::value_objects::{RelPath, SessionId};
use std::io;

/// Ledger-aware writer for one replica.
#[derive(Clone)]
pub struct Applier {
    replica: LocalReplica,
    ledger: OperationLedger,
}

impl Applier {
    pub fn new(replica: LocalReplica, ledger: OperationLedger) -> Self {
        Self { replica, ledger }
    }

    pub fn replica(&self) -> &LocalReplica {
        &self.replica
    }

    pub fn ledger(&self) -> &OperationLedger {
        &self.ledger
    }

    fn mark(&self, family: OpFamily, path: &RelPath, origin: Option<SessionId>) {
        self.ledger.register_from(OperationKey::new(family, path.clone()), origin);
    }

    /// Parent directories created implicitly would otherwise echo as mkdirs.
    async fn mark_missing_ancestors(&self, path: &RelPath, origin: Option<SessionId>) {
        for dir in self.replica.missing_ancestors(path).await {
            self.mark(OpFamily::Mkdir, &dir, origin);
        }
    }

    /// Create or overwrite a file.
    pub async fn write(&self, path: &RelPath, content: &[u8], origin: Option<SessionId>) -> Result<(), SyncError> {
        self.mark_missing_ancestors(path, origin).await;
        self.mark(OpFamily::Write, path, origin);
        self.replica
            .write_file(path, content)
            .await
            .map_err(|e| SyncError::apply("write", path, e))
    }

    /// Remove a file or directory tree. Returns whether anything existed.
    pub async fn remove(&self, path: &RelPath, origin: Option<SessionId>) -> Result<bool, SyncError> {
        self.mark(OpFamily::Delete, path, origin);
        self.replica
            .remove(path)
            .await
            .map_err(|e| SyncError::apply("delete", path, e))
    }

    /// Create a directory and any missing parents.
    pub async fn mkdir(&self, path: &RelPath, origin: Option<SessionId>) -> Result<(), SyncError> {
        self.mark_missing_ancestors(path, origin).await;
        self.mark(OpFamily::Mkdir, path, origin);
        self.replica
            .ensure_dir(path)
            .await
            .map_err(|e| SyncError::apply("mkdir", path, e))
    }

    /// Move an entry.
    ///
    /// Native watchers report a rename either as one rename event or as a
    /// delete plus a create, so every form is registered.
    pub async fn rename(&self, from: &RelPath, to: &RelPath, origin: Option<SessionId>) -> Result<(), SyncError> {
        let kind = self.replica.kind_of(from).await.ok_or_else(|| {
            SyncError::apply(
                "rename",
                from,
                io::Error::new(io::ErrorKind::NotFound, "source does not exist"),
            )
        })?;

        self.mark(OpFamily::Rename, from, origin);
        self.mark(OpFamily::Delete, from, origin);
        self.mark_missing_ancestors(to, origin).await;
        match kind {
            EntryKind::Directory => self.mark(OpFamily::Mkdir, to, origin),
            EntryKind::File => self.mark(OpFamily::Write, to, origin),
        }

        self.replica
            .rename(from, to)
            .await
            .map_err(|e| SyncError::apply("rename", from, e))
    }

    /// Set permission bits.
    ///
    /// The drift poller runs on its own task and may observe the new mode
    /// before the caller updates its cache; the key covers that window.
    pub async fn chmod(&self, path: &RelPath, mode: u32, origin: Option<SessionId>) -> Result<(), SyncError> {
        self.mark(OpFamily::Chmod, path, origin);
        self.replica
            .set_mode(path, mode)
            .await
            .map_err(|e| SyncError::apply("chmod", path, e))
    }
}
