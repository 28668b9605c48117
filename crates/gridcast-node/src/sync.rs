//! The sync engine: per-peer convergence over the shared root.
//!
//! One dispatcher task owns the local content set and the session cache.
//! Work arrives as path invalidations (from the watcher), peer-set
//! replacements (from presence), or the one-second heartbeat tick; the
//! dispatcher snapshots `(pending, peers)` under the state mutex, releases
//! it, and only then does IO. Peers are processed sequentially; at most
//! one session per peer is ever active.
//!
//! A convergence pass uploads every local entry that is absent or
//! digest-different remotely, then deletes remote entries absent locally
//! (upload wins the tie for digest mismatches), and repeats until a full
//! pass makes no change or the pass limit runs out.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridcast_core::constants::{LIST_RETRIES, MAX_SYNC_PASSES, SYNC_TICK};
use gridcast_core::content::{normalize_rel_path, ContentEntry, ContentHasher, ContentSet};
use gridcast_core::error::Result;

use crate::session::SessionCache;
use crate::status::NodeStatus;

// =============================================================================
// Public Types
// =============================================================================

/// A sync target: one foreign peer's bulk endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPeer {
    /// `ip:port`, the session cache key.
    pub key: String,
    pub addr: SocketAddrV4,
}

/// Progress and outcome events, mirrored into heartbeats and logs.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connecting { peer: String },
    Listing { peer: String },
    Uploading { peer: String, rel: String, bytes: u64, total: u64 },
    Deleting { peer: String, rel: String },
    Done { peer: String },
    Error { peer: String, message: String },
}

pub type SyncEventSender = mpsc::UnboundedSender<SyncEvent>;

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
enum Invalidation {
    /// Drop the whole content set and rescan the root.
    Rescan,
    /// One relative path changed or vanished.
    Path(String),
}

#[derive(Default)]
struct SyncState {
    pending: VecDeque<Invalidation>,
    peers: Vec<SyncPeer>,
    /// Peer keys already converged against the current content set.
    converged: Vec<String>,
    /// Content pushes flow only while enabled (the node is master). The
    /// content set keeps updating either way so enabling is instant.
    enabled: bool,
    stop: bool,
}

struct Shared {
    state: Mutex<SyncState>,
    notify: Notify,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.lock().stop
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle used by the watcher bridge and presence to feed the
/// engine. Enqueueing never blocks on IO: it takes the state mutex only to
/// splice, then signals.
#[derive(Clone)]
pub struct SyncHandle {
    shared: Arc<Shared>,
}

impl SyncHandle {
    /// Queue changed relative paths for re-hash and reconvergence.
    pub fn invalidate_paths(&self, paths: impl IntoIterator<Item = String>) {
        {
            let mut state = self.shared.lock();
            for path in paths {
                state.pending.push_back(Invalidation::Path(path));
            }
        }
        self.shared.notify.notify_one();
    }

    /// Queue a full rescan of the shared root.
    pub fn request_rescan(&self) {
        {
            let mut state = self.shared.lock();
            state.pending.push_back(Invalidation::Rescan);
        }
        self.shared.notify.notify_one();
    }

    /// Replace the peer set. Converged flags survive for peers that stay;
    /// new peers start unconverged.
    pub fn set_peers(&self, peers: Vec<SyncPeer>) {
        {
            let mut state = self.shared.lock();
            state
                .converged
                .retain(|key| peers.iter().any(|p| &p.key == key));
            state.peers = peers;
        }
        self.shared.notify.notify_one();
    }

    /// Gate peer convergence on the master role. Disabling does not cancel
    /// an in-flight cycle; it stops new ones from starting.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.lock().enabled = enabled;
        self.shared.notify.notify_one();
    }

    /// Ask the dispatcher to exit at its next boundary.
    pub fn stop(&self) {
        self.shared.lock().stop = true;
        self.shared.notify.notify_one();
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The running sync dispatcher.
pub struct SyncEngine {
    handle: SyncHandle,
    task: JoinHandle<()>,
}

impl SyncEngine {
    /// Spawn the dispatcher over `root`. An initial full rescan is queued.
    pub fn spawn(
        root: PathBuf,
        hasher: ContentHasher,
        status: NodeStatus,
        events: Option<SyncEventSender>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SyncState::default()),
            notify: Notify::new(),
        });
        let handle = SyncHandle {
            shared: shared.clone(),
        };
        handle.request_rescan();

        let task = tokio::spawn(run(root, hasher, status, events, shared));
        Self { handle, task }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Stop and wait for the dispatcher to exit.
    pub async fn shutdown(self) {
        self.handle.stop();
        let _ = self.task.await;
    }
}

async fn run(
    root: PathBuf,
    hasher: ContentHasher,
    status: NodeStatus,
    events: Option<SyncEventSender>,
    shared: Arc<Shared>,
) {
    let mut local = ContentSet::new();
    let mut sessions = SessionCache::new();

    loop {
        // Wait for a signal or the heartbeat tick (failed peers retry).
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(SYNC_TICK) => {}
        }

        // Snapshot phase: take the work, mark targets, release the lock.
        let (updates, targets) = {
            let mut state = shared.lock();
            if state.stop {
                break;
            }
            let updates = std::mem::take(&mut state.pending);
            let has_new = !updates.is_empty();
            if has_new {
                // Everything must reconverge against the new content set.
                state.converged.clear();
            }
            let targets: Vec<SyncPeer> = if state.enabled {
                state
                    .peers
                    .iter()
                    .filter(|p| !state.converged.contains(&p.key))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            (updates, targets)
        };

        // Heavy disk IO (hashing) happens off the async workers.
        if !updates.is_empty() {
            let root = root.clone();
            let hasher = hasher.clone();
            let mut set = std::mem::take(&mut local);
            local = tokio::task::spawn_blocking(move || {
                apply_invalidations(&root, &hasher, &mut set, updates);
                set
            })
            .await
            .unwrap_or_default();
        }

        for peer in targets {
            if shared.stopped() {
                break;
            }
            match converge_peer(&root, &local, &peer, &mut sessions, &status, &events, &shared)
                .await
            {
                Ok(true) => {
                    let mut state = shared.lock();
                    if state.peers.iter().any(|p| p.key == peer.key)
                        && !state.converged.contains(&peer.key)
                    {
                        state.converged.push(peer.key.clone());
                    }
                }
                Ok(false) => debug!(peer = %peer.key, "convergence interrupted"),
                Err(err) => {
                    sessions.discard(&peer.key);
                    warn!(peer = %peer.key, %err, "sync cycle failed, will retry");
                    emit(
                        &events,
                        SyncEvent::Error {
                            peer: peer.key.clone(),
                            message: err.to_string(),
                        },
                    );
                }
            }
            status.clear_sync_status();
        }
    }
    debug!("sync dispatcher stopped");
}

// =============================================================================
// Content Set Maintenance
// =============================================================================

fn apply_invalidations(
    root: &Path,
    hasher: &ContentHasher,
    local: &mut ContentSet,
    updates: VecDeque<Invalidation>,
) {
    let mut queue = updates;
    while let Some(invalidation) = queue.pop_front() {
        match invalidation {
            Invalidation::Rescan => {
                local.clear();
                for rel in collect_rel_files(root) {
                    queue.push_back(Invalidation::Path(rel));
                }
            }
            Invalidation::Path(rel) => {
                let abs = root.join(&rel);
                hasher.invalidate(&abs);
                let Ok(meta) = abs.metadata() else {
                    local.remove(&rel);
                    continue;
                };
                if !meta.is_file() {
                    local.remove(&rel);
                    continue;
                }
                match hasher.digest(&abs) {
                    Ok(digest) => {
                        local.insert(
                            rel,
                            ContentEntry {
                                size: meta.len(),
                                digest,
                            },
                        );
                    }
                    // Unreadable right now; the watcher will re-emit it.
                    Err(err) => debug!(%rel, %err, "skipping unreadable file"),
                }
            }
        }
    }
}

fn collect_rel_files(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel = normalize_rel_path(&rel.to_string_lossy());
                    if !rel.ends_with(".tmp") {
                        out.push(rel);
                    }
                }
            }
        }
    }
    out
}

// =============================================================================
// Per-Peer Convergence
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn converge_peer(
    root: &Path,
    local: &ContentSet,
    peer: &SyncPeer,
    sessions: &mut SessionCache,
    status: &NodeStatus,
    events: &Option<SyncEventSender>,
    shared: &Shared,
) -> Result<bool> {
    emit(
        events,
        SyncEvent::Connecting {
            peer: peer.key.clone(),
        },
    );
    let session = sessions.get(&peer.key, peer.addr).await?;

    for pass in 1..=MAX_SYNC_PASSES {
        if shared.stopped() {
            return Ok(false);
        }

        emit(
            events,
            SyncEvent::Listing {
                peer: peer.key.clone(),
            },
        );
        let mut remote = session.list().await?;
        if remote.is_empty() && !local.is_empty() {
            for _ in 1..LIST_RETRIES {
                remote = session.list().await?;
                if !remote.is_empty() {
                    break;
                }
            }
        }

        let mut changed = false;

        // Upload first: a digest mismatch means "replace", never "delete".
        for (rel, entry) in local {
            if shared.stopped() {
                return Ok(false);
            }
            let needs_upload = remote
                .get(rel)
                .map_or(true, |theirs| theirs.digest != entry.digest);
            if !needs_upload {
                continue;
            }

            status.set_sync_status(true, rel, 0.0);
            emit(
                events,
                SyncEvent::Uploading {
                    peer: peer.key.clone(),
                    rel: rel.clone(),
                    bytes: 0,
                    total: entry.size,
                },
            );
            let abs = root.join(rel);
            session
                .upload(&abs, rel, |bytes, total| {
                    let fraction = if total > 0 {
                        bytes as f32 / total as f32
                    } else {
                        1.0
                    };
                    status.set_sync_status(true, rel, fraction);
                    emit(
                        events,
                        SyncEvent::Uploading {
                            peer: peer.key.clone(),
                            rel: rel.clone(),
                            bytes,
                            total,
                        },
                    );
                })
                .await?;
            changed = true;
        }

        // Then delete what only the remote has.
        for rel in remote.keys() {
            if shared.stopped() {
                return Ok(false);
            }
            if local.contains_key(rel) {
                continue;
            }
            emit(
                events,
                SyncEvent::Deleting {
                    peer: peer.key.clone(),
                    rel: rel.clone(),
                },
            );
            session.delete(rel).await?;
            changed = true;
        }

        if !changed {
            info!(peer = %peer.key, pass, "peer converged");
            emit(
                events,
                SyncEvent::Done {
                    peer: peer.key.clone(),
                },
            );
            return Ok(true);
        }
    }

    // Pass limit exhausted with changes still flowing; next cycle retries.
    warn!(peer = %peer.key, passes = MAX_SYNC_PASSES, "sync passes exhausted");
    emit(
        events,
        SyncEvent::Done {
            peer: peer.key.clone(),
        },
    );
    Ok(false)
}

fn emit(events: &Option<SyncEventSender>, event: SyncEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
