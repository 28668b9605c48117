//! Presence: the live peer map, heartbeat broadcasting, and liveness decay.
//!
//! Peer records are owned here; the sync engine receives snapshots taken
//! under the map lock, never references into it. Records are created on
//! the first frame from a foreign node, refreshed on every frame, and
//! evicted once nothing has been heard for the liveness timeout.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridcast_core::constants::{HEARTBEAT_INTERVAL, PEER_TIMEOUT};
use gridcast_core::protocol::{Frame, Heartbeat};
use gridcast_core::NodeId;

use crate::messenger::Messenger;
use crate::status::NodeStatus;
use crate::sync::{SyncHandle, SyncPeer};

// =============================================================================
// Peer Records
// =============================================================================

/// Everything the node knows about one cluster member.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub ip: Option<Ipv4Addr>,
    pub sync_port: Option<u16>,
    pub is_self: bool,
    pub is_master: bool,
    pub last_seen: Instant,
    pub is_syncing: bool,
    pub sync_progress: f32,
    pub sync_filename: String,
}

impl PeerRecord {
    fn new(id: NodeId, is_self: bool) -> Self {
        Self {
            id,
            ip: None,
            sync_port: None,
            is_self,
            is_master: false,
            last_seen: Instant::now(),
            is_syncing: false,
            sync_progress: 0.0,
            sync_filename: String::new(),
        }
    }

    /// The peer's bulk-transport endpoint, once known.
    pub fn endpoint(&self) -> Option<SocketAddrV4> {
        Some(SocketAddrV4::new(self.ip?, self.sync_port?))
    }
}

// =============================================================================
// Peer Map
// =============================================================================

/// Shared, mutex-guarded map of live peers, keyed by node ID.
#[derive(Debug)]
pub struct PeerMap {
    inner: Mutex<HashMap<NodeId, PeerRecord>>,
    self_id: NodeId,
}

impl PeerMap {
    /// Create the map with the local node's own record pre-inserted.
    pub fn new(self_id: NodeId, self_ip: Ipv4Addr, sync_port: u16) -> Self {
        let mut map = HashMap::new();
        let mut own = PeerRecord::new(self_id, true);
        own.ip = Some(self_ip);
        own.sync_port = Some(sync_port);
        map.insert(self_id, own);
        Self {
            inner: Mutex::new(map),
            self_id,
        }
    }

    /// Refresh a peer from a heartbeat. Returns true when this is a peer
    /// the map did not know (or whose endpoint just changed); callers use
    /// that to signal the sync engine.
    pub fn upsert_heartbeat(&self, sender: NodeId, from_ip: Ipv4Addr, hb: &Heartbeat) -> bool {
        let mut map = self.lock();
        let record = map
            .entry(sender)
            .or_insert_with(|| PeerRecord::new(sender, false));
        let endpoint_changed =
            record.ip != Some(from_ip) || record.sync_port != Some(hb.sync_port);
        record.ip = Some(from_ip);
        record.sync_port = Some(hb.sync_port);
        record.is_master = hb.is_master;
        record.is_syncing = hb.is_syncing;
        record.sync_progress = hb.progress;
        record.sync_filename = hb.filename.clone();
        record.last_seen = Instant::now();
        endpoint_changed
    }

    /// Refresh a peer from an announce handshake. Returns true when the
    /// endpoint is news.
    pub fn upsert_endpoint(&self, sender: NodeId, endpoint: SocketAddrV4) -> bool {
        let mut map = self.lock();
        let record = map
            .entry(sender)
            .or_insert_with(|| PeerRecord::new(sender, false));
        let changed =
            record.ip != Some(*endpoint.ip()) || record.sync_port != Some(endpoint.port());
        record.ip = Some(*endpoint.ip());
        record.sync_port = Some(endpoint.port());
        record.last_seen = Instant::now();
        changed
    }

    /// Mirror the local status into the self record (for the GUI contract).
    pub fn update_self(&self, hb: &Heartbeat) {
        let mut map = self.lock();
        if let Some(record) = map.get_mut(&self.self_id) {
            record.is_master = hb.is_master;
            record.is_syncing = hb.is_syncing;
            record.sync_progress = hb.progress;
            record.sync_filename = hb.filename.clone();
            record.last_seen = Instant::now();
        }
    }

    /// Drop foreign peers not heard from within `timeout`.
    pub fn evict_stale(&self, timeout: std::time::Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let mut map = self.lock();
        let stale: Vec<NodeId> = map
            .values()
            .filter(|r| !r.is_self && now.duration_since(r.last_seen) > timeout)
            .map(|r| r.id)
            .collect();
        for id in &stale {
            map.remove(id);
        }
        stale
    }

    /// Snapshot of every record, self included.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let map = self.lock();
        let mut records: Vec<PeerRecord> = map.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// The sync targets: every foreign peer with a known endpoint.
    pub fn sync_peers(&self) -> Vec<SyncPeer> {
        let map = self.lock();
        let mut peers: Vec<SyncPeer> = map
            .values()
            .filter(|r| !r.is_self)
            .filter_map(|r| {
                let addr = r.endpoint()?;
                Some(SyncPeer {
                    key: addr.to_string(),
                    addr,
                })
            })
            .collect();
        peers.sort_by(|a, b| a.key.cmp(&b.key));
        peers
    }

    /// True when any foreign peer currently claims mastership.
    pub fn has_active_master(&self) -> bool {
        self.lock().values().any(|r| !r.is_self && r.is_master)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, PeerRecord>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Service Loops
// =============================================================================

/// Broadcast one heartbeat per interval, mirroring it into the self record.
pub fn spawn_heartbeat_loop(
    messenger: Arc<Messenger>,
    peers: Arc<PeerMap>,
    status: NodeStatus,
    sync_port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let hb = status.heartbeat(sync_port);
                    peers.update_self(&hb);
                    if let Err(err) = messenger.broadcast(&Frame::Heartbeat(hb)).await {
                        failures += 1;
                        // Log once per N so a dead interface does not flood.
                        if failures % 10 == 1 {
                            warn!(%err, failures, "heartbeat broadcast failed");
                        }
                    } else {
                        failures = 0;
                    }
                }
            }
        }
    })
}

/// Evict stale peers once per heartbeat interval, pushing fresh snapshots
/// to the sync engine when the set shrinks.
pub fn spawn_eviction_loop(
    peers: Arc<PeerMap>,
    sync: SyncHandle,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let evicted = peers.evict_stale(PEER_TIMEOUT);
                    if !evicted.is_empty() {
                        for id in &evicted {
                            info!(peer = %id, "peer timed out");
                        }
                        sync.set_peers(peers.sync_peers());
                    } else {
                        debug!(peers = peers.len(), "presence tick");
                    }
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn hb(is_master: bool, sync_port: u16) -> Heartbeat {
        Heartbeat {
            is_master,
            sync_port,
            is_syncing: false,
            progress: 0.0,
            filename: String::new(),
        }
    }

    #[test]
    fn self_record_exists_at_startup() {
        let peers = PeerMap::new(id("AAAAAAAA"), Ipv4Addr::new(192, 168, 1, 2), 4000);
        let snapshot = peers.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_self);
        assert_eq!(
            snapshot[0].endpoint(),
            Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 4000))
        );
    }

    #[test]
    fn heartbeat_upsert_creates_then_refreshes() {
        let peers = PeerMap::new(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 4000);
        let b = id("BBBBBBBB");
        let ip = Ipv4Addr::new(192, 168, 1, 3);

        assert!(peers.upsert_heartbeat(b, ip, &hb(false, 5000)));
        // Same endpoint again: no news.
        assert!(!peers.upsert_heartbeat(b, ip, &hb(true, 5000)));
        // Port moved: news again.
        assert!(peers.upsert_heartbeat(b, ip, &hb(true, 5001)));

        let record = peers
            .snapshot()
            .into_iter()
            .find(|r| r.id == b)
            .unwrap();
        assert!(!record.is_self);
        assert!(record.is_master);
        assert_eq!(record.sync_port, Some(5001));
    }

    #[test]
    fn eviction_drops_only_stale_foreigners() {
        let peers = PeerMap::new(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 4000);
        peers.upsert_heartbeat(id("BBBBBBBB"), Ipv4Addr::LOCALHOST, &hb(false, 5000));

        // Nothing is stale yet.
        assert!(peers.evict_stale(Duration::from_secs(5)).is_empty());

        // With a zero timeout the foreign peer goes; self never does.
        let evicted = peers.evict_stale(Duration::ZERO);
        assert_eq!(evicted, vec![id("BBBBBBBB")]);
        assert_eq!(peers.len(), 1);
        assert!(peers.snapshot()[0].is_self);
    }

    #[test]
    fn sync_peers_excludes_self_and_unknown_endpoints() {
        let peers = PeerMap::new(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 4000);
        peers.upsert_heartbeat(id("BBBBBBBB"), Ipv4Addr::new(10, 0, 0, 2), &hb(false, 5000));

        let targets = peers.sync_peers();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].key, "10.0.0.2:5000");
    }

    #[test]
    fn active_master_tracking() {
        let peers = PeerMap::new(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 4000);
        assert!(!peers.has_active_master());
        peers.upsert_heartbeat(id("BBBBBBBB"), Ipv4Addr::LOCALHOST, &hb(true, 5000));
        assert!(peers.has_active_master());
    }

    #[test]
    fn announce_endpoint_upsert() {
        let peers = PeerMap::new(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 4000);
        let endpoint = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 6000);
        assert!(peers.upsert_endpoint(id("CCCCCCCC"), endpoint));
        assert!(!peers.upsert_endpoint(id("CCCCCCCC"), endpoint));
        let record = peers
            .snapshot()
            .into_iter()
            .find(|r| r.id == id("CCCCCCCC"))
            .unwrap();
        assert_eq!(record.endpoint(), Some(endpoint));
    }
}
