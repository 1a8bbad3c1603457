//! Edge Agent
//!
//! Keeps a local replica in step with the hub: reconciles against the
//! hub's snapshot on every (re)connect, applies broadcast changes, and
//! forwards local edits as operations.

use crate::adapters::outbound::{snapshot, snapshot_subtree, LocalReplica, ModeTracker};
use crate::domain::entities::{ChangeEvent, ChangeKind, FsEntry};
use crate::domain::errors::SyncError;
use crate::domain::ports::{ChangeSource, WatchHandle};
use crate::domain::services::{reconcile, OperationLedger};
use crate::domain::value_objects::RelPath;
use crate::infrastructure::ShutdownController;
use crate::replication::apply::Applier;
use crate::replication::config::ReplicationConfig;
use crate::replication::protocol::{message_type_name, ChangeEventName, ChangeNotice, Message, OperationError, OperationRequest};
use crate::replication::transport::{self, SessionHandle, TransportEvent};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection state of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Disconnected,
    Connecting,
    /// Connected, reconciling against the hub's snapshot
    InitialSync,
    /// Reconciled; local edits are forwarded
    Steady,
}

/// Per-connection state. Dropping it stops the watch and the poller.
struct SessionContext {
    session: SessionHandle,
    snapshot_received: bool,
    pending: HashSet<RelPath>,
    local_tx: mpsc::Sender<ChangeEvent>,
    watch: Option<WatchHandle>,
    poller: Option<JoinHandle<()>>,
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Edge side of the replication protocol.
pub struct EdgeAgent {
    config: ReplicationConfig,
    applier: Applier,
    modes: ModeTracker,
    change_source: Arc<dyn ChangeSource>,
    shutdown: ShutdownController,
    state: RwLock<EdgeState>,
    completed_syncs: AtomicU64,
}

impl EdgeAgent {
    /// Create an edge over `config.root`, creating the root if needed.
    pub fn new(config: ReplicationConfig, change_source: Arc<dyn ChangeSource>) -> anyhow::Result<Self> {
        config.validate()?;

        let replica = LocalReplica::open(&config.root)?;
        let ledger = OperationLedger::new(config.suppression_window);

        Ok(Self {
            config,
            modes: ModeTracker::new(replica.clone()),
            applier: Applier::new(replica, ledger),
            change_source,
            shutdown: ShutdownController::new(),
            state: RwLock::new(EdgeState::Disconnected),
            completed_syncs: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.applier.replica().root()
    }

    pub fn state(&self) -> EdgeState {
        *self.state.read()
    }

    /// Number of initial syncs finished, one per successful (re)connect.
    pub fn completed_syncs(&self) -> u64 {
        self.completed_syncs.load(Ordering::Relaxed)
    }

    pub fn shutdown_controller(&self) -> ShutdownController {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    fn set_state(&self, state: EdgeState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!("edge {} state {:?} -> {:?}", self.config.node_id, previous, state);
        }
    }

    /// Connect, sync, and reconnect with backoff until shutdown or until
    /// the reconnect budget is spent.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        tracing::info!(
            "starting edge node_id={} root={:?} hub={}",
            self.config.node_id,
            self.root(),
            self.config.hub_addr
        );

        let mut failures: u32 = 0;
        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            self.set_state(EdgeState::Connecting);
            let connected = tokio::select! {
                result = transport::connect(
                    &self.config.hub_addr,
                    self.config.max_frame_bytes,
                    self.config.channel_capacity,
                ) => result,
                _ = self.shutdown.cancelled() => break,
            };

            match connected {
                Ok((session, events)) => {
                    failures = 0;
                    tracing::info!("connected to hub {}", session.peer());
                    match self.run_session(session, events).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Disconnected) => {
                            tracing::warn!("lost connection to hub {}", self.config.hub_addr);
                        }
                        Err(e) => {
                            self.set_state(EdgeState::Disconnected);
                            return Err(e.into());
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("connect attempt {} failed: {}", failures, e);
                    if let Some(max) = self.config.max_reconnect_attempts {
                        if max > 0 && failures >= max {
                            self.set_state(EdgeState::Disconnected);
                            anyhow::bail!("giving up on hub {} after {} attempts", self.config.hub_addr, failures);
                        }
                    }
                }
            }

            self.set_state(EdgeState::Disconnected);
            let delay = backoff_delay(
                self.config.reconnect_delay,
                self.config.max_reconnect_delay,
                failures,
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.set_state(EdgeState::Disconnected);
        tracing::info!("edge {} stopped", self.config.node_id);
        Ok(())
    }

    /// Drive one connection. Only a watch failure is an error.
    async fn run_session(
        &self,
        session: SessionHandle,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> Result<SessionEnd, SyncError> {
        self.set_state(EdgeState::InitialSync);
        self.modes.clear();

        let (local_tx, mut local_rx) = mpsc::channel(self.config.channel_capacity);
        let mut ctx = SessionContext {
            session,
            snapshot_received: false,
            pending: HashSet::new(),
            local_tx,
            watch: None,
            poller: None,
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::MessageReceived { message, .. }) => {
                        match self.handle_hub_message(&mut ctx, message).await {
                            Ok(()) => {}
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                tracing::warn!("session ended: {}", e);
                                return Ok(SessionEnd::Disconnected);
                            }
                        }
                    }
                    Some(TransportEvent::Malformed { reason, .. }) => {
                        tracing::warn!("malformed message from hub: {}", reason);
                        let _ = ctx.session.send(Message::OperationError(OperationError::new(reason, "unknown", "")));
                    }
                    Some(TransportEvent::Connected(_)) => {}
                    Some(TransportEvent::Disconnected(_)) | None => return Ok(SessionEnd::Disconnected),
                },
                Some(change) = local_rx.recv() => {
                    for message in self.handle_local_event(change).await {
                        match ctx.session.send(message) {
                            Ok(()) => {}
                            Err(SyncError::Transport(reason)) => {
                                tracing::debug!("send to hub failed: {}", reason);
                                return Ok(SessionEnd::Disconnected);
                            }
                            Err(e) => tracing::warn!("local change not sent: {}", e),
                        }
                    }
                }
                _ = self.shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            }
        }
    }

    async fn handle_hub_message(&self, ctx: &mut SessionContext, message: Message) -> Result<(), SyncError> {
        match message {
            Message::State(entries) => self.reconcile(ctx, entries).await,
            Message::Content { path, content } => {
                match self.applier.write(&path, &content, None).await {
                    Ok(()) => self.modes.refresh(&path).await,
                    Err(e) => tracing::warn!("failed to store {}: {}", path, e),
                }
                ctx.pending.remove(&path);
                self.finish_sync_if_ready(ctx).await
            }
            Message::Change(notice) => {
                match self.apply_change(notice).await {
                    Ok(Some(path)) => {
                        ctx.session.send(Message::ContentQuery { path: path.to_string() })?;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("failed to apply change: {}", e),
                }
                Ok(())
            }
            Message::OperationError(err) => {
                tracing::warn!("hub rejected {} {}: {}", err.operation, err.path, err.message);
                if let Ok(path) = RelPath::parse(&err.path) {
                    if ctx.pending.remove(&path) {
                        return self.finish_sync_if_ready(ctx).await;
                    }
                }
                Ok(())
            }
            other => {
                let name = message_type_name(&other);
                tracing::warn!("unexpected {} message from hub", name);
                ctx.session.send(Message::OperationError(OperationError::new(
                    format!("unexpected {} message", name),
                    "unknown",
                    "",
                )))
            }
        }
    }

    /// Make the replica match the hub's snapshot.
    ///
    /// Entries the hub does not have are removed, hub directories are
    /// ensured, and every hub file is fetched. Local files too large to
    /// ever reach the hub are kept.
    async fn reconcile(&self, ctx: &mut SessionContext, remote: Vec<FsEntry>) -> Result<(), SyncError> {
        let local = snapshot(self.root()).await;
        let limit = self.config.max_frame_bytes;
        let unsendable: HashSet<RelPath> = local
            .iter()
            .filter(|e| e.size.is_some_and(|size| !transport::content_fits(&e.path, size, limit)))
            .map(|e| e.path.clone())
            .collect();

        let plan = reconcile::plan(&local, &remote, &unsendable);
        tracing::info!(
            "initial sync: local={} remote={} delete={} mkdir={} fetch={}",
            local.len(),
            remote.len(),
            plan.deletions.len(),
            plan.directories.len(),
            plan.fetches.len()
        );
        for path in &plan.retained {
            tracing::warn!("initial sync: keeping local-only {}, too large for frame limit {}", path, limit);
        }

        for path in &plan.deletions {
            match self.applier.remove(path, None).await {
                Ok(_) => self.modes.forget(path),
                Err(e) => tracing::warn!("initial sync: {}", e),
            }
        }
        for dir in &plan.directories {
            if let Err(e) = self.applier.mkdir(dir, None).await {
                tracing::warn!("initial sync: {}", e);
            }
        }
        for path in plan.fetches {
            ctx.session.send(Message::ContentQuery { path: path.to_string() })?;
            ctx.pending.insert(path);
        }

        ctx.snapshot_received = true;
        self.finish_sync_if_ready(ctx).await
    }

    async fn finish_sync_if_ready(&self, ctx: &mut SessionContext) -> Result<(), SyncError> {
        if ctx.watch.is_some() || !ctx.snapshot_received || !ctx.pending.is_empty() {
            return Ok(());
        }
        self.enter_steady(ctx).await
    }

    /// Warm the mode cache, then start watching and polling.
    async fn enter_steady(&self, ctx: &mut SessionContext) -> Result<(), SyncError> {
        let entries = snapshot(self.root()).await;
        self.modes.clear();
        let tracked = self.modes.warm(entries.into_iter().map(|e| e.path)).await;

        ctx.watch = Some(self.change_source.watch(self.root(), ctx.local_tx.clone())?);
        ctx.poller = Some(
            self.modes
                .start_polling(self.config.mode_poll_interval, ctx.local_tx.clone()),
        );

        self.set_state(EdgeState::Steady);
        self.completed_syncs.fetch_add(1, Ordering::Relaxed);
        tracing::info!("initial sync complete, watching {:?} ({} paths tracked)", self.root(), tracked);
        Ok(())
    }

    /// Apply one hub broadcast.
    ///
    /// Returns the path to query when an add/change arrived without content.
    pub async fn apply_change(&self, notice: ChangeNotice) -> Result<Option<RelPath>, SyncError> {
        let path = notice.path;
        if path.is_hidden() {
            return Ok(None);
        }

        match notice.event {
            ChangeEventName::Add | ChangeEventName::Change => match notice.content {
                Some(content) => {
                    self.applier.write(&path, &content, None).await?;
                    self.modes.refresh(&path).await;
                    Ok(None)
                }
                None => Ok(Some(path)),
            },
            ChangeEventName::Unlink | ChangeEventName::UnlinkDir => {
                self.applier.remove(&path, None).await?;
                self.modes.forget(&path);
                Ok(None)
            }
            ChangeEventName::AddDir => {
                self.applier.mkdir(&path, None).await?;
                self.modes.refresh(&path).await;
                Ok(None)
            }
            ChangeEventName::Chmod => {
                let mode = notice
                    .mode
                    .ok_or_else(|| SyncError::Protocol(format!("chmod {} without mode", path)))?;
                // Cached first so a concurrent poll never sees the new mode as drift.
                self.modes.record(path.clone(), mode);
                if let Err(e) = self.applier.chmod(&path, mode, None).await {
                    self.modes.refresh(&path).await;
                    return Err(e);
                }
                Ok(None)
            }
        }
    }

    /// Turn a local change into the operations to send to the hub.
    ///
    /// Echoes of changes applied from the hub are dropped.
    pub async fn handle_local_event(&self, event: ChangeEvent) -> Vec<Message> {
        let key = event.operation_key();
        if self.applier.ledger().is_active(&key) {
            tracing::trace!("suppressed echo {}", key);
            return Vec::new();
        }

        match event.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let content = match event.payload {
                    Some(payload) => payload,
                    None => match self.applier.replica().read_file(&event.path).await {
                        Ok(content) => content,
                        Err(e) => {
                            tracing::debug!("skipping {}: {}", event.path, e);
                            return Vec::new();
                        }
                    },
                };
                self.modes.refresh(&event.path).await;
                if !self.sendable(&event.path, content.len() as u64) {
                    return Vec::new();
                }
                vec![Message::Operation(OperationRequest::write(&event.path, content))]
            }
            ChangeKind::Deleted | ChangeKind::DirDeleted => {
                self.modes.forget(&event.path);
                vec![Message::Operation(OperationRequest::delete(&event.path))]
            }
            ChangeKind::DirAdded => {
                self.modes.refresh(&event.path).await;
                let mut out = vec![Message::Operation(OperationRequest::mkdir(&event.path))];
                // Contents that arrived with the directory may not be reported separately.
                for entry in snapshot_subtree(self.root(), &event.path).await {
                    if entry.is_dir() {
                        out.push(Message::Operation(OperationRequest::mkdir(&entry.path)));
                    } else if self.sendable(&entry.path, entry.size.unwrap_or(0)) {
                        if let Ok(content) = self.applier.replica().read_file(&entry.path).await {
                            out.push(Message::Operation(OperationRequest::write(&entry.path, content)));
                        }
                    }
                    self.modes.refresh(&entry.path).await;
                }
                out
            }
            ChangeKind::Renamed => match event.new_path {
                Some(to) => {
                    self.modes.forget(&event.path);
                    self.modes.refresh(&to).await;
                    vec![Message::Operation(OperationRequest::rename(&event.path, &to))]
                }
                None => vec![Message::Operation(OperationRequest::delete(&event.path))],
            },
            ChangeKind::ModeChanged => match event.mode {
                Some(mode) => {
                    self.modes.record(event.path.clone(), mode);
                    vec![Message::Operation(OperationRequest::chmod(&event.path, mode))]
                }
                None => Vec::new(),
            },
        }
    }

    /// Whether a local file of `len` bytes can be forwarded at all.
    fn sendable(&self, path: &RelPath, len: u64) -> bool {
        let limit = self.config.max_frame_bytes;
        if transport::content_fits(path, len, limit) {
            return true;
        }
        tracing::warn!("not replicating {}: {} bytes exceeds frame limit {}", path, len, limit);
        false
    }
}

/// Exponential backoff with up to 10% jitter, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp).min(max);
    let jitter_ms = delay.as_millis() as u64 / 10;
    if jitter_ms == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
    (delay + Duration::from_millis(jitter)).min(max)
}
