//! End-to-end sync engine runs against a real bulk server: a master root
//! converging a peer root over localhost TCP.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::sync::watch;

use gridcast_core::content::ContentHasher;
use gridcast_node::server::BulkServer;
use gridcast_node::status::{NodeStatus, Role};
use gridcast_node::sync::{SyncEngine, SyncPeer};
use gridcast_test_utils::{wait_until, TestRoot};

struct Cluster {
    master_root: TestRoot,
    peer_root: TestRoot,
    engine: SyncEngine,
    status: NodeStatus,
    _server: BulkServer,
    _shutdown: watch::Sender<bool>,
}

/// A master engine over `master_root`, aimed at a server over `peer_root`.
async fn two_node_cluster() -> Cluster {
    let master_root = TestRoot::new();
    let peer_root = TestRoot::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = BulkServer::spawn(
        peer_root.path().to_path_buf(),
        ContentHasher::new(),
        None,
        shutdown_rx,
    )
    .await
    .expect("server spawns");
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server.port());

    let status = NodeStatus::new(Role::Master);
    let engine = SyncEngine::spawn(
        master_root.path().to_path_buf(),
        ContentHasher::new(),
        status.clone(),
        None,
    );
    let handle = engine.handle();
    handle.set_enabled(true);
    handle.set_peers(vec![SyncPeer {
        key: addr.to_string(),
        addr,
    }]);

    Cluster {
        master_root,
        peer_root,
        engine,
        status,
        _server: server,
        _shutdown: shutdown_tx,
    }
}

const CONVERGE_WINDOW: Duration = Duration::from_secs(10);

#[tokio::test]
async fn empty_peer_receives_the_master_tree() {
    let cluster = two_node_cluster().await;
    cluster.master_root.write("videos/foo.mp4", vec![0x5A; 64 * 1024]);
    cluster.master_root.write("configs/a.mappings.json", b"{}");
    cluster.engine.handle().request_rescan();

    let converged = wait_until(CONVERGE_WINDOW, || {
        cluster.peer_root.exists("videos/foo.mp4")
            && cluster.peer_root.exists("configs/a.mappings.json")
    })
    .await;
    assert!(converged, "peer never received the master tree");

    assert_eq!(
        cluster.peer_root.digest("videos/foo.mp4"),
        cluster.master_root.digest("videos/foo.mp4")
    );
    assert_eq!(cluster.master_root.rel_files(), cluster.peer_root.rel_files());

    cluster.engine.shutdown().await;
}

#[tokio::test]
async fn peer_only_files_are_deleted() {
    let cluster = two_node_cluster().await;
    cluster.master_root.write("videos/keep.mp4", b"keep me");
    cluster.peer_root.write("videos/bar.mp4", b"stale peer-only file");
    cluster.engine.handle().request_rescan();

    let converged = wait_until(CONVERGE_WINDOW, || {
        cluster.peer_root.exists("videos/keep.mp4") && !cluster.peer_root.exists("videos/bar.mp4")
    })
    .await;
    assert!(converged, "divergent peer file survived the cycle");

    // The master side is untouched.
    assert_eq!(cluster.master_root.read("videos/keep.mp4"), b"keep me");
    assert!(!cluster.master_root.exists("videos/bar.mp4"));

    cluster.engine.shutdown().await;
}

#[tokio::test]
async fn digest_mismatch_replaces_the_peer_copy() {
    let cluster = two_node_cluster().await;
    cluster.master_root.write("videos/clip.mp4", b"version two");
    cluster.peer_root.write("videos/clip.mp4", b"version one");
    cluster.engine.handle().request_rescan();

    let converged = wait_until(CONVERGE_WINDOW, || {
        cluster
            .peer_root
            .exists("videos/clip.mp4")
            .then(|| cluster.peer_root.read("videos/clip.mp4") == b"version two")
            .unwrap_or(false)
    })
    .await;
    assert!(converged, "peer copy was not replaced");

    cluster.engine.shutdown().await;
}

#[tokio::test]
async fn path_invalidation_triggers_reconvergence() {
    let cluster = two_node_cluster().await;
    cluster.master_root.write("videos/first.mp4", b"first");
    cluster.engine.handle().request_rescan();

    assert!(
        wait_until(CONVERGE_WINDOW, || cluster.peer_root.exists("videos/first.mp4")).await,
        "initial convergence failed"
    );

    // A later local change re-arms the converged peer via invalidation,
    // the path a watcher batch takes.
    cluster.master_root.write("videos/second.mp4", b"second");
    cluster
        .engine
        .handle()
        .invalidate_paths(["videos/second.mp4".to_string()]);

    assert!(
        wait_until(CONVERGE_WINDOW, || cluster.peer_root.exists("videos/second.mp4")).await,
        "reconvergence after invalidation failed"
    );

    // Sync status was cleared once the cycle finished.
    let hb = cluster.status.heartbeat(0);
    assert!(!hb.is_syncing);

    cluster.engine.shutdown().await;
}

#[tokio::test]
async fn disabled_engine_does_not_push() {
    let cluster = two_node_cluster().await;
    cluster.engine.handle().set_enabled(false);
    cluster.master_root.write("videos/held.mp4", b"held back");
    cluster.engine.handle().request_rescan();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !cluster.peer_root.exists("videos/held.mp4"),
        "peer received content while the engine was disabled"
    );

    // Re-enabling pushes the pending content without further prompting.
    cluster.engine.handle().set_enabled(true);
    assert!(
        wait_until(CONVERGE_WINDOW, || cluster.peer_root.exists("videos/held.mp4")).await,
        "enable did not resume convergence"
    );

    cluster.engine.shutdown().await;
}
