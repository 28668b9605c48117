//! Node assembly: wires discovery, replication, and sync into one runtime.
//!
//! Startup order: project tree, identity, bulk server (fixes the sync
//! port), interface discovery, presence + control plane, sync engine,
//! watcher. Shutdown walks the same list in reverse.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gridcast_core::constants::SHUTDOWN_TIMEOUT;
use gridcast_core::content::ContentHasher;
use gridcast_core::error::Result;
use gridcast_core::identity::Settings;
use gridcast_core::mapping::MappingDocument;
use gridcast_core::netinfo;
use gridcast_core::protocol::{Announce, Envelope, Frame, GridKind, PointEdit};
use gridcast_core::watcher::{FolderWatcher, WatcherConfig};
use gridcast_core::NodeId;

use crate::messenger::{Inbound, Messenger};
use crate::presence::{self, PeerMap, PeerRecord};
use crate::project::ProjectLayout;
use crate::receiver::PushReceiver;
use crate::server::BulkServer;
use crate::status::{NodeStatus, Role};
use crate::sync::{SyncEngine, SyncEvent, SyncHandle};

// =============================================================================
// Configuration and Events
// =============================================================================

/// Startup parameters, typically derived from the CLI.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub project_dir: std::path::PathBuf,
    pub presence_port: u16,
    pub initial_role: Role,
    pub watcher: WatcherConfig,
}

/// Events surfaced to the embedding application (the renderer).
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// The replicated document changed under this node.
    DocumentChanged,
    /// A peer asked every node to reload its scripts.
    ScriptReload,
    /// Opaque JSON payload for the scripting layer.
    ScriptCall(Bytes),
}

// =============================================================================
// Node
// =============================================================================

/// One running cluster member.
pub struct Node {
    id: NodeId,
    layout: ProjectLayout,
    status: NodeStatus,
    document: Arc<Mutex<MappingDocument>>,
    peers: Arc<PeerMap>,
    messenger: Option<Arc<Messenger>>,
    sync: SyncHandle,
    sync_engine: Option<SyncEngine>,
    server: Option<BulkServer>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    app_events: Option<mpsc::UnboundedReceiver<AppEvent>>,
    endpoint: SocketAddrV4,
}

impl Node {
    /// Bring the node up. Fatal only when the project tree cannot be
    /// created or the presence port cannot be bound; a failed interface
    /// discovery degrades to a local-only node with a warning.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let layout = ProjectLayout::prepare(&config.project_dir)?;
        let (_, id) = Settings::load_or_create(layout.settings())?;
        info!(%id, project = %layout.root().display(), "node starting");

        let hasher = ContentHasher::new();
        let status = NodeStatus::new(config.initial_role);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Bulk server first: its ephemeral port is the advertised endpoint.
        let server = BulkServer::spawn(
            layout.synced().to_path_buf(),
            hasher.clone(),
            None,
            shutdown_rx.clone(),
        )
        .await?;
        let sync_port = server.port();

        // Interface discovery; presence is skipped when it fails entirely.
        let ip_pair = match netinfo::discover() {
            Ok(pair) => Some(pair),
            Err(err) => {
                warn!(%err, "interface discovery failed, running without presence");
                None
            }
        };
        let preferred = ip_pair.map(|p| p.preferred).unwrap_or(Ipv4Addr::LOCALHOST);
        let endpoint = SocketAddrV4::new(preferred, sync_port);

        let peers = Arc::new(PeerMap::new(id, preferred, sync_port));

        // The replicated document, seeded from this node's mapping file.
        let document = Arc::new(Mutex::new(load_initial_document(&layout, id)));

        // Sync engine; content pushes only flow while this node is master.
        let (sync_event_tx, sync_event_rx) = mpsc::unbounded_channel();
        let sync_engine = SyncEngine::spawn(
            layout.synced().to_path_buf(),
            hasher.clone(),
            status.clone(),
            Some(sync_event_tx),
        );
        let sync = sync_engine.handle();
        sync.set_enabled(config.initial_role == Role::Master);
        tasks.push(spawn_sync_event_log(sync_event_rx, shutdown_rx.clone()));

        // Control plane and presence.
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let messenger = match ip_pair {
            Some(pair) => {
                let messenger =
                    Arc::new(Messenger::bind(id, pair.broadcast, config.presence_port)?);

                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                tasks.push(messenger.spawn_recv_loop(inbound_tx, shutdown_rx.clone()));
                tasks.push(spawn_router(
                    inbound_rx,
                    RouterContext {
                        messenger: messenger.clone(),
                        peers: peers.clone(),
                        status: status.clone(),
                        document: document.clone(),
                        sync: sync.clone(),
                        receiver: PushReceiver::new(layout.synced().to_path_buf(), hasher.clone()),
                        app_events: app_tx,
                        endpoint,
                    },
                    shutdown_rx.clone(),
                ));
                tasks.push(presence::spawn_heartbeat_loop(
                    messenger.clone(),
                    peers.clone(),
                    status.clone(),
                    sync_port,
                    shutdown_rx.clone(),
                ));
                tasks.push(presence::spawn_eviction_loop(
                    peers.clone(),
                    sync.clone(),
                    shutdown_rx.clone(),
                ));

                // Bootstrap handshake: tell the segment our endpoint now
                // instead of waiting a heartbeat round.
                if let Err(err) = messenger
                    .broadcast(&Frame::Announce(Announce { endpoint }))
                    .await
                {
                    warn!(%err, "startup announce failed");
                }

                Some(messenger)
            }
            None => None,
        };

        // Watcher feeds the sync engine with settled changes.
        let watcher = FolderWatcher::spawn(layout.synced().to_path_buf(), config.watcher);
        tasks.push(spawn_watcher_bridge(watcher, sync.clone(), shutdown_rx));

        Ok(Self {
            id,
            layout,
            status,
            document,
            peers,
            messenger,
            sync,
            sync_engine: Some(sync_engine),
            server: Some(server),
            tasks,
            shutdown_tx,
            app_events: Some(app_rx),
            endpoint,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddrV4 {
        self.endpoint
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn role(&self) -> Role {
        self.status.role()
    }

    /// Snapshot of the live peer table (self included).
    pub fn peer_snapshot(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    /// Receiver for renderer-facing events. Available once.
    pub fn take_app_events(&mut self) -> Option<mpsc::UnboundedReceiver<AppEvent>> {
        self.app_events.take()
    }

    /// Toggle the local role. Masters author edits and push content; peers
    /// apply what they receive.
    pub fn set_role(&self, role: Role) {
        if self.status.role() == role {
            return;
        }
        self.status.set_role(role);
        let is_master = role == Role::Master;
        self.sync.set_enabled(is_master);
        if is_master {
            self.sync.set_peers(self.peers.sync_peers());
            self.sync.request_rescan();
            info!("switched to MASTER");
        } else {
            info!("switched to PEER");
        }
    }

    /// Author one point edit: apply locally, then broadcast the delta.
    /// A no-op unless this node is master.
    pub async fn author_point_edit(
        &self,
        owner: NodeId,
        surface_index: u8,
        grid: GridKind,
        point_index: u16,
        x: f32,
        y: f32,
    ) -> Result<()> {
        if !self.status.is_master() {
            return Ok(());
        }
        {
            let mut doc = self.lock_document();
            doc.apply_point_edit(
                owner.as_str(),
                surface_index as usize,
                grid,
                point_index as usize,
                x,
                y,
            );
        }
        if let Some(messenger) = &self.messenger {
            messenger
                .broadcast(&Frame::PointEdit(PointEdit {
                    owner,
                    surface_index,
                    grid,
                    point_index,
                    x,
                    y,
                }))
                .await?;
        }
        Ok(())
    }

    /// Broadcast the full document, superseding any lost deltas. Sent by
    /// the renderer on every mouse release; a no-op unless master.
    pub async fn broadcast_structure(&self) -> Result<()> {
        if !self.status.is_master() {
            return Ok(());
        }
        let json = {
            let doc = self.lock_document();
            doc.serialize()?
        };
        if let Some(messenger) = &self.messenger {
            messenger
                .broadcast(&Frame::StructureSnapshot(Bytes::from(json)))
                .await?;
        }
        Ok(())
    }

    /// Push one shared file to every peer over the control plane. A no-op
    /// unless this node is master; peers already holding the content drop
    /// the offer on their digest pre-check.
    pub async fn push_file(&self, rel: &str) -> Result<()> {
        if !self.status.is_master() {
            return Ok(());
        }
        if let Some(messenger) = &self.messenger {
            let abs = self.layout.synced().join(rel);
            messenger.push_file(&abs, rel).await?;
        }
        Ok(())
    }

    /// Ask every node to reload its scripts.
    pub async fn broadcast_script_reload(&self) -> Result<()> {
        if let Some(messenger) = &self.messenger {
            messenger.broadcast(&Frame::ScriptReload).await?;
        }
        Ok(())
    }

    /// Forward an opaque JSON payload to every node's scripting layer.
    pub async fn broadcast_script_call(&self, payload: Bytes) -> Result<()> {
        if let Some(messenger) = &self.messenger {
            messenger.broadcast(&Frame::ScriptCall(payload)).await?;
        }
        Ok(())
    }

    /// True when any foreign peer currently claims mastership.
    pub fn has_active_master(&self) -> bool {
        self.peers.has_active_master()
    }

    /// Persist this node's mapping file under `synced/configs/`.
    pub fn save_mapping(&self) -> Result<()> {
        let doc = self.lock_document().clone();
        doc.save(&self.layout.mappings_path_for(self.id.as_str()))
    }

    /// Read access for the renderer; clones under the lock.
    pub fn document(&self) -> MappingDocument {
        self.lock_document().clone()
    }

    /// Mutate the document locally (master-side GUI edits).
    pub fn with_document<R>(&self, f: impl FnOnce(&mut MappingDocument) -> R) -> R {
        let mut doc = self.lock_document();
        f(&mut doc)
    }

    /// Graceful shutdown in dependency-reverse order: sync, transport,
    /// presence, watcher. Joins are bounded.
    pub async fn shutdown(mut self) {
        info!("node shutting down");
        self.sync.stop();
        if let Some(engine) = self.sync_engine.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, engine.shutdown()).await;
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(server) = self.server.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, server.join()).await;
        }
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await;
        }
        info!("node stopped");
    }

    fn lock_document(&self) -> std::sync::MutexGuard<'_, MappingDocument> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_initial_document(layout: &ProjectLayout, id: NodeId) -> MappingDocument {
    let path = layout.mappings_path_for(id.as_str());
    match MappingDocument::load(&path) {
        Ok(doc) => doc,
        Err(err) => {
            debug!(%err, path = %path.display(), "no mapping file yet, starting empty");
            MappingDocument::new()
        }
    }
}

// =============================================================================
// Service Tasks
// =============================================================================

/// Everything the inbound router needs, snapshotted at startup.
struct RouterContext {
    messenger: Arc<Messenger>,
    peers: Arc<PeerMap>,
    status: NodeStatus,
    document: Arc<Mutex<MappingDocument>>,
    sync: SyncHandle,
    receiver: PushReceiver,
    app_events: mpsc::UnboundedSender<AppEvent>,
    endpoint: SocketAddrV4,
}

fn spawn_router(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut ctx: RouterContext,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (envelope, from) = tokio::select! {
                _ = shutdown.changed() => return,
                received = inbound.recv() => match received {
                    Some(pair) => pair,
                    None => return,
                },
            };
            route_frame(&mut ctx, envelope, from).await;
        }
    })
}

async fn route_frame(ctx: &mut RouterContext, envelope: Envelope, from: SocketAddr) {
    let sender = envelope.sender;
    let IpAddr::V4(from_ip) = from.ip() else {
        return;
    };

    match envelope.frame {
        Frame::Heartbeat(hb) => {
            if ctx.peers.upsert_heartbeat(sender, from_ip, &hb) {
                debug!(peer = %sender, "peer endpoint learned from heartbeat");
                ctx.sync.set_peers(ctx.peers.sync_peers());
            }
        }
        Frame::Announce(announce) => {
            if ctx.peers.upsert_endpoint(sender, announce.endpoint) {
                ctx.sync.set_peers(ctx.peers.sync_peers());
            }
            // Unicast our own endpoint straight back.
            let reply = Frame::AnnounceReply(Announce {
                endpoint: ctx.endpoint,
            });
            if let Err(err) = ctx.messenger.send_to(from, &reply).await {
                warn!(%err, "announce reply failed");
            }
        }
        Frame::AnnounceReply(announce) => {
            if ctx.peers.upsert_endpoint(sender, announce.endpoint) {
                ctx.sync.set_peers(ctx.peers.sync_peers());
            }
        }
        Frame::PointEdit(edit) => {
            // Masters author their own edits; only peers apply foreign ones.
            if ctx.status.is_master() {
                return;
            }
            let applied = {
                let mut doc = ctx.document.lock().unwrap_or_else(|e| e.into_inner());
                doc.apply_point_edit(
                    edit.owner.as_str(),
                    edit.surface_index as usize,
                    edit.grid,
                    edit.point_index as usize,
                    edit.x,
                    edit.y,
                )
            };
            if applied {
                let _ = ctx.app_events.send(AppEvent::DocumentChanged);
            }
        }
        Frame::StructureSnapshot(json) => {
            if ctx.status.is_master() {
                return;
            }
            let outcome = {
                let mut doc = ctx.document.lock().unwrap_or_else(|e| e.into_inner());
                doc.apply_snapshot(&json)
            };
            match outcome {
                Ok(()) => {
                    debug!(from = %sender, bytes = json.len(), "structure snapshot applied");
                    let _ = ctx.app_events.send(AppEvent::DocumentChanged);
                }
                // Prior document is retained on parse failure.
                Err(err) => error!(from = %sender, %err, "bad structure snapshot"),
            }
        }
        Frame::FileOffer(offer) => ctx.receiver.handle_offer(&offer),
        Frame::FileChunk(chunk) => ctx.receiver.handle_chunk(&chunk),
        Frame::FileEnd => {
            if let Err(err) = ctx.receiver.handle_end() {
                error!(%err, "pushed file commit failed");
            }
        }
        Frame::ScriptReload => {
            let _ = ctx.app_events.send(AppEvent::ScriptReload);
        }
        Frame::ScriptCall(payload) => {
            let _ = ctx.app_events.send(AppEvent::ScriptCall(payload));
        }
    }
}

fn spawn_watcher_bridge(
    mut watcher: FolderWatcher,
    sync: SyncHandle,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    watcher.stop();
                    return;
                }
                batch = watcher.recv() => match batch {
                    Some(paths) => {
                        debug!(count = paths.len(), "watcher batch -> sync engine");
                        sync.invalidate_paths(paths);
                    }
                    None => return,
                },
            }
        }
    })
}

fn spawn_sync_event_log(
    mut events: mpsc::UnboundedReceiver<SyncEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                SyncEvent::Connecting { peer } => debug!(%peer, "sync: connecting"),
                SyncEvent::Listing { peer } => debug!(%peer, "sync: listing"),
                SyncEvent::Uploading {
                    peer,
                    rel,
                    bytes,
                    total,
                } => debug!(%peer, %rel, bytes, total, "sync: uploading"),
                SyncEvent::Deleting { peer, rel } => debug!(%peer, %rel, "sync: deleting"),
                SyncEvent::Done { peer } => debug!(%peer, "sync: cycle done"),
                SyncEvent::Error { peer, message } => warn!(%peer, %message, "sync: error"),
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            project_dir: dir.to_path_buf(),
            presence_port: 0, // ephemeral; keeps parallel tests apart
            initial_role: Role::Peer,
            watcher: WatcherConfig {
                scan_interval: Duration::from_millis(50),
                settle_time: Duration::from_millis(50),
            },
        }
    }

    #[tokio::test]
    async fn node_starts_and_shuts_down_within_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(config(dir.path())).await.unwrap();

        assert_eq!(node.role(), Role::Peer);
        assert!(node.endpoint().port() != 0);
        // Self record exists from startup.
        let snapshot = node.peer_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_self);

        let started = Instant::now();
        node.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn id_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(config(dir.path())).await.unwrap();
        let first = node.id();
        node.shutdown().await;

        let node = Node::start(config(dir.path())).await.unwrap();
        assert_eq!(node.id(), first);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn role_toggle_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(config(dir.path())).await.unwrap();
        node.set_role(Role::Master);
        assert_eq!(node.role(), Role::Master);
        node.set_role(Role::Peer);
        assert_eq!(node.role(), Role::Peer);
        node.shutdown().await;
    }
}
