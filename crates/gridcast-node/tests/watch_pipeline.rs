//! Full pipeline: filesystem watcher -> sync engine -> bulk transport.
//! A file written on the master appears on the peer without any manual
//! rescan, driven purely by watcher emission.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::sync::watch;

use gridcast_core::content::ContentHasher;
use gridcast_core::watcher::{FolderWatcher, WatcherConfig};
use gridcast_node::server::BulkServer;
use gridcast_node::status::{NodeStatus, Role};
use gridcast_node::sync::{SyncEngine, SyncPeer};
use gridcast_test_utils::{wait_until, TestRoot};

#[tokio::test]
async fn watched_write_propagates_to_the_peer() {
    let master_root = TestRoot::new();
    let peer_root = TestRoot::new();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = BulkServer::spawn(
        peer_root.path().to_path_buf(),
        ContentHasher::new(),
        None,
        shutdown_rx,
    )
    .await
    .expect("server spawns");
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server.port());

    let engine = SyncEngine::spawn(
        master_root.path().to_path_buf(),
        ContentHasher::new(),
        NodeStatus::new(Role::Master),
        None,
    );
    let handle = engine.handle();
    handle.set_enabled(true);
    handle.set_peers(vec![SyncPeer {
        key: addr.to_string(),
        addr,
    }]);

    // Bridge watcher batches into the engine, the way the node wires it.
    let mut watcher = FolderWatcher::spawn(
        master_root.path().to_path_buf(),
        WatcherConfig {
            scan_interval: Duration::from_millis(50),
            settle_time: Duration::from_millis(80),
        },
    );
    let bridge_handle = engine.handle();
    tokio::spawn(async move {
        while let Some(batch) = watcher.recv().await {
            bridge_handle.invalidate_paths(batch);
        }
    });

    // Write after the services are up: only the watcher can notice it.
    master_root.write("videos/live.mp4", vec![0x42; 32 * 1024]);

    let converged = wait_until(Duration::from_secs(10), || {
        peer_root.exists("videos/live.mp4")
    })
    .await;
    assert!(converged, "watched write never reached the peer");
    assert_eq!(
        peer_root.digest("videos/live.mp4"),
        master_root.digest("videos/live.mp4")
    );

    // An in-progress atomic write (`.tmp`) never propagates.
    master_root.write("videos/partial.mp4.tmp", b"partial");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!peer_root.exists("videos/partial.mp4.tmp"));

    engine.shutdown().await;
}
