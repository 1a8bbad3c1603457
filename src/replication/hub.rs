//! Hub Agent
//!
//! Owns the canonical root. Serves snapshots and file content to edges,
//! applies their operations, and broadcasts every change of the canonical
//! root to the connected edges.

use crate::adapters::outbound::{snapshot, snapshot_subtree, LocalReplica};
use crate::domain::entities::{ChangeEvent, ChangeKind, EntryKind};
use crate::domain::errors::SyncError;
use crate::domain::ports::ChangeSource;
use crate::domain::services::OperationLedger;
use crate::domain::value_objects::{RelPath, SessionId};
use crate::infrastructure::ShutdownController;
use crate::replication::apply::Applier;
use crate::replication::config::ReplicationConfig;
use crate::replication::protocol::{message_type_name, ChangeNotice, Message, Operation, OperationError, OperationRequest};
use crate::replication::transport::{self, SessionHandle, TransportEvent};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Hub side of the replication protocol.
pub struct HubAgent {
    config: ReplicationConfig,
    applier: Applier,
    change_source: Arc<dyn ChangeSource>,
    sessions: DashMap<SessionId, SessionHandle>,
    shutdown: ShutdownController,
    operations_applied: AtomicU64,
}

impl HubAgent {
    /// Create a hub over `config.root`, creating the root if needed.
    pub fn new(config: ReplicationConfig, change_source: Arc<dyn ChangeSource>) -> anyhow::Result<Self> {
        config.validate()?;

        let replica = LocalReplica::open(&config.root)?;
        let ledger = OperationLedger::new(config.suppression_window);

        Ok(Self {
            config,
            applier: Applier::new(replica, ledger),
            change_source,
            sessions: DashMap::new(),
            shutdown: ShutdownController::new(),
            operations_applied: AtomicU64::new(0),
        })
    }

    /// Canonical root (canonicalized).
    pub fn root(&self) -> &Path {
        self.applier.replica().root()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of edge operations applied successfully.
    pub fn operations_applied(&self) -> u64 {
        self.operations_applied.load(Ordering::Relaxed)
    }

    pub fn shutdown_controller(&self) -> ShutdownController {
        self.shutdown.clone()
    }

    /// Stop accepting, drop all sessions and the watch.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    /// Bind the listener, attach the watch, and spawn the event loop.
    ///
    /// Returns the bound address. A watch failure is fatal.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        tracing::info!(
            "starting hub node_id={} root={:?} listen={}",
            self.config.node_id,
            self.root(),
            self.config.listen_addr
        );

        let (addr, mut events, accept) = transport::listen(
            self.config.listen_addr,
            self.config.max_frame_bytes,
            self.config.channel_capacity,
        )
        .await?;

        let (local_tx, mut local_rx) = mpsc::channel(self.config.channel_capacity);
        let watch = match self.change_source.watch(self.root(), local_tx) {
            Ok(watch) => watch,
            Err(e) => {
                accept.abort();
                return Err(e.into());
            }
        };

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let _watch = watch;
            loop {
                tokio::select! {
                    Some(event) = events.recv() => hub.handle_transport_event(event).await,
                    Some(change) = local_rx.recv() => {
                        hub.on_local_change(change).await;
                    }
                    _ = hub.shutdown.cancelled() => break,
                }
            }
            accept.abort();
            hub.sessions.clear();
            tracing::info!("hub {} stopped", hub.config.node_id);
        });

        Ok(addr)
    }

    /// Start and serve until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = self.start().await?;
        tracing::info!("hub ready on {}", addr);
        self.shutdown.cancelled().await;
        Ok(())
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(session) => self.on_connect(session).await,
            TransportEvent::MessageReceived { from, message } => match message {
                Message::Operation(request) => self.on_remote_operation(from, request).await,
                Message::ContentQuery { path } => self.on_query_content(from, &path).await,
                Message::OperationError(err) => {
                    tracing::warn!(
                        "session {} reported {} {} failed: {}",
                        from,
                        err.operation,
                        err.path,
                        err.message
                    );
                }
                other => {
                    let name = message_type_name(&other);
                    tracing::warn!("unexpected {} message from session {}", name, from);
                    self.reply(
                        from,
                        Message::OperationError(OperationError::new(
                            format!("unexpected {} message", name),
                            "unknown",
                            "",
                        )),
                    );
                }
            },
            TransportEvent::Malformed { from, reason } => {
                tracing::warn!("malformed message from session {}: {}", from, reason);
                self.reply(
                    from,
                    Message::OperationError(OperationError::new(reason, "unknown", "")),
                );
            }
            TransportEvent::Disconnected(id) => self.on_disconnect(id),
        }
    }

    /// Register a session and send it the full snapshot.
    pub async fn on_connect(&self, session: SessionHandle) {
        let id = session.id();
        let entries = snapshot(self.root()).await;
        tracing::info!(
            "edge connected session={} peer={} entries={}",
            id,
            session.peer(),
            entries.len()
        );

        if let Err(e) = session.send(Message::State(entries)) {
            tracing::warn!("failed to send snapshot to session {}: {}", id, e);
            return;
        }
        self.sessions.insert(id, session);
    }

    pub fn on_disconnect(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            tracing::info!("edge disconnected session={}", id);
        }
    }

    /// Answer a content query with the file's bytes or a not-found error.
    ///
    /// A file too large for one frame is answered with an error as well, so
    /// the edge's initial sync still completes.
    pub async fn on_query_content(&self, from: SessionId, raw_path: &str) {
        let content = match RelPath::parse(raw_path) {
            Ok(path) if !path.is_hidden() => self
                .applier
                .replica()
                .read_file(&path)
                .await
                .ok()
                .map(|content| (path, content)),
            _ => None,
        };

        let reply = match content {
            Some((path, content)) if self.fits(&path, &content) => Message::Content { path, content },
            Some((path, content)) => {
                tracing::warn!(
                    "not serving {} to session {}: {} bytes exceeds frame limit {}",
                    path,
                    from,
                    content.len(),
                    self.config.max_frame_bytes
                );
                Message::OperationError(OperationError::new(
                    format!("file of {} bytes exceeds frame limit", content.len()),
                    "contentQuery",
                    raw_path,
                ))
            }
            None => {
                tracing::debug!("content query for missing {} from session {}", raw_path, from);
                Message::OperationError(OperationError::new(
                    format!("not found: {}", raw_path),
                    "contentQuery",
                    raw_path,
                ))
            }
        };
        self.reply(from, reply);
    }

    fn fits(&self, path: &RelPath, content: &[u8]) -> bool {
        transport::content_fits(path, content.len() as u64, self.config.max_frame_bytes)
    }

    /// Apply an edge's operation to the canonical root.
    ///
    /// The resulting local change is broadcast to every other edge by the
    /// watch loop. Failures are reported to the sender only.
    pub async fn on_remote_operation(&self, from: SessionId, request: OperationRequest) {
        let result = match request.parse() {
            Ok(op) => self.apply_operation(from, op).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.operations_applied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("applied {} {} from session {}", request.operation, request.path, from);
            }
            Err(e) => {
                tracing::warn!(
                    "operation {} {} from session {} failed: {}",
                    request.operation,
                    request.path,
                    from,
                    e
                );
                self.reply(
                    from,
                    Message::OperationError(OperationError::new(e.to_string(), request.operation, request.path)),
                );
            }
        }
    }

    async fn apply_operation(&self, from: SessionId, op: Operation) -> Result<(), SyncError> {
        let origin = Some(from);
        match op {
            Operation::Write { path, content } => self.applier.write(&path, &content, origin).await,
            Operation::Delete { path } => self.applier.remove(&path, origin).await.map(|_| ()),
            Operation::Mkdir { path } => self.applier.mkdir(&path, origin).await,
            Operation::Rename { from: src, to } => self.applier.rename(&src, &to, origin).await,
            Operation::Chmod { path, mode } => {
                self.applier.chmod(&path, mode, origin).await?;
                // The watcher does not report permission changes.
                let kind = self
                    .applier
                    .replica()
                    .kind_of(&path)
                    .await
                    .unwrap_or(EntryKind::File);
                self.broadcast(&Message::Change(ChangeNotice::chmod(path, kind, mode)), None);
                Ok(())
            }
        }
    }

    /// Broadcast a local change of the canonical root.
    ///
    /// A change the hub itself applied for an edge skips that edge.
    /// Returns the number of deliveries.
    pub async fn on_local_change(&self, event: ChangeEvent) -> usize {
        let exclude = self
            .applier
            .ledger()
            .lookup(&event.operation_key())
            .and_then(|registration| registration.origin);

        let mut sent = 0;
        for notice in self.notices_for(&event).await {
            sent += self.broadcast(&Message::Change(notice), exclude);
        }
        sent
    }

    async fn notices_for(&self, event: &ChangeEvent) -> Vec<ChangeNotice> {
        let path = event.path.clone();
        match event.kind {
            ChangeKind::Added => vec![ChangeNotice::add(path, self.content_of(&event.path).await)],
            ChangeKind::Modified => vec![ChangeNotice::change(path, self.content_of(&event.path).await)],
            ChangeKind::Deleted => vec![ChangeNotice::unlink(path)],
            ChangeKind::DirAdded => vec![ChangeNotice::add_dir(path)],
            ChangeKind::DirDeleted => vec![ChangeNotice::unlink_dir(path)],
            ChangeKind::ModeChanged => match event.mode {
                Some(mode) => {
                    let kind = self
                        .applier
                        .replica()
                        .kind_of(&path)
                        .await
                        .unwrap_or(EntryKind::File);
                    vec![ChangeNotice::chmod(path, kind, mode)]
                }
                None => Vec::new(),
            },
            ChangeKind::Renamed => {
                let Some(to) = event.new_path.clone() else {
                    return vec![ChangeNotice::unlink(path)];
                };
                self.rename_notices(path, to).await
            }
        }
    }

    /// Edges receive a rename as a removal plus a re-creation.
    async fn rename_notices(&self, from: RelPath, to: RelPath) -> Vec<ChangeNotice> {
        match self.applier.replica().kind_of(&to).await {
            Some(EntryKind::Directory) => {
                let mut notices = vec![ChangeNotice::unlink_dir(from), ChangeNotice::add_dir(to.clone())];
                for entry in snapshot_subtree(self.root(), &to).await {
                    if entry.is_dir() {
                        notices.push(ChangeNotice::add_dir(entry.path));
                    } else {
                        let content = self.content_of(&entry.path).await;
                        notices.push(ChangeNotice::add(entry.path, content));
                    }
                }
                notices
            }
            Some(EntryKind::File) => {
                let content = self.content_of(&to).await;
                vec![ChangeNotice::unlink(from), ChangeNotice::add(to, content)]
            }
            None => vec![ChangeNotice::unlink(from)],
        }
    }

    /// Content to inline in a notice. Oversized files go out without it and
    /// the edge's follow-up query gets the error.
    async fn content_of(&self, path: &RelPath) -> Option<Vec<u8>> {
        let content = self.applier.replica().read_file(path).await.ok()?;
        self.fits(path, &content).then_some(content)
    }

    /// Send a message to every session except `exclude`.
    pub fn broadcast(&self, message: &Message, exclude: Option<SessionId>) -> usize {
        let targets: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .map(|entry| entry.value().clone())
            .collect();

        let mut sent = 0;
        for session in targets {
            match session.send(message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("broadcast to session {} failed: {}", session.id(), e),
            }
        }
        sent
    }

    fn reply(&self, to: SessionId, message: Message) {
        let Some(session) = self.sessions.get(&to).map(|s| s.value().clone()) else {
            tracing::debug!("session {} gone, dropping {}", to, message_type_name(&message));
            return;
        };
        if let Err(e) = session.send(message) {
            tracing::warn!("reply to session {} failed: {}", to, e);
        }
    }
}
