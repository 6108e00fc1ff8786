//! Hub/peer end-to-end tests
//!
//! These tests run a real hub on a loopback socket and connect real
//! `ClientSession`s to it.
//!
//! ## What These Tests Verify
//!
//! - Bootstrap mirrors the hub tree and wipes peer-only files
//! - Ignored entries survive the bootstrap on the peer side
//! - A wrong secret is rejected and never joins the broadcast set
//! - Changes flow peer → hub → other peers, and hub → all peers
//!
//! Watcher events are injected through the channel rather than produced by
//! the OS, except in the `LocalWatcher` tests at the end.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dirsync_core::sync::{ChangeDetector, Debouncer, WatchEvent, WatchKind};
use dirsync_core::{
    ChangeEvent, ClientSession, Hub, IgnoreList, LocalTree, LocalWatcher, RelativePath,
    SyncConfig, SyncError,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

// ============================================================================
// Helpers
// ============================================================================

const SECRET: &str = "letmein";

fn config(root: &Path, port: u16, password: &str) -> SyncConfig {
    SyncConfig {
        root: root.to_path_buf(),
        password: password.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        ..SyncConfig::default()
    }
}

async fn start_hub(root: &Path) -> (Hub, u16) {
    let hub = Hub::bind(&config(root, 0, SECRET)).await.unwrap();
    let port = hub.local_addr().unwrap().port();
    let accepting = hub.clone();
    tokio::spawn(async move { accepting.run().await });
    (hub, port)
}

/// Poll `check` until it holds or ten seconds pass
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

async fn wait_for_sessions(hub: &Hub, expected: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while hub.session_count().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "hub never reached {} sessions", expected);
}

/// Connect a peer and start its loops with an injectable watcher channel
async fn start_peer(root: &Path, port: u16) -> mpsc::UnboundedSender<WatchEvent> {
    let session = ClientSession::connect(&config(root, port, SECRET))
        .await
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(session.run(Some(rx)));
    tx
}

/// Peers anchor their tree at the canonical root; watcher paths must match
fn canonical(dir: &TempDir) -> PathBuf {
    std::fs::canonicalize(dir.path()).unwrap()
}

fn read(path: impl AsRef<Path>) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Test that a fresh peer ends with exactly the hub's non-ignored files.
#[tokio::test]
async fn test_bootstrap_mirrors_hub_tree() {
    let hub_dir = TempDir::new().unwrap();
    std::fs::write(hub_dir.path().join("a.txt"), b"x").unwrap();
    std::fs::create_dir_all(hub_dir.path().join("b")).unwrap();
    std::fs::write(hub_dir.path().join("b/c.txt"), b"y").unwrap();
    std::fs::create_dir_all(hub_dir.path().join(".git")).unwrap();
    std::fs::write(hub_dir.path().join(".git/HEAD"), b"hub ref").unwrap();

    let peer_dir = TempDir::new().unwrap();
    std::fs::write(peer_dir.path().join("stale.txt"), b"old").unwrap();
    std::fs::create_dir_all(peer_dir.path().join(".git")).unwrap();
    std::fs::write(peer_dir.path().join(".git/HEAD"), b"peer ref").unwrap();

    let (hub, port) = start_hub(hub_dir.path()).await;
    let _session = ClientSession::connect(&config(peer_dir.path(), port, SECRET))
        .await
        .unwrap();

    assert_eq!(read(peer_dir.path().join("a.txt")).unwrap(), b"x");
    assert_eq!(read(peer_dir.path().join("b/c.txt")).unwrap(), b"y");
    assert!(!peer_dir.path().join("stale.txt").exists());
    // the peer's own ignored entries are untouched
    assert_eq!(read(peer_dir.path().join(".git/HEAD")).unwrap(), b"peer ref");

    wait_for_sessions(&hub, 1).await;
    hub.shutdown().await;
}

/// Test that a bootstrap into a missing root directory creates it.
#[tokio::test]
async fn test_bootstrap_creates_missing_root() {
    let hub_dir = TempDir::new().unwrap();
    std::fs::write(hub_dir.path().join("only.txt"), b"1").unwrap();
    let peer_parent = TempDir::new().unwrap();
    let peer_root = peer_parent.path().join("fresh/checkout");

    let (hub, port) = start_hub(hub_dir.path()).await;
    let _session = ClientSession::connect(&config(&peer_root, port, SECRET))
        .await
        .unwrap();

    assert_eq!(read(peer_root.join("only.txt")).unwrap(), b"1");
    hub.shutdown().await;
}

/// Test that a wrong secret is refused and the hub keeps no session.
#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let hub_dir = TempDir::new().unwrap();
    std::fs::write(hub_dir.path().join("secret.txt"), b"classified").unwrap();
    let peer_dir = TempDir::new().unwrap();

    let (hub, port) = start_hub(hub_dir.path()).await;
    let result = ClientSession::connect(&config(peer_dir.path(), port, "guess")).await;

    assert!(matches!(result, Err(SyncError::AuthenticationRejected)));
    assert!(!peer_dir.path().join("secret.txt").exists());
    assert_eq!(hub.session_count().await, 0);
    hub.shutdown().await;
}

/// Test that connecting to a port nobody listens on fails cleanly.
#[tokio::test]
async fn test_connect_without_hub_fails() {
    let peer_dir = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let unused = listener.local_addr().unwrap().port();
    drop(listener);

    let result = ClientSession::connect(&config(peer_dir.path(), unused, SECRET)).await;
    assert!(matches!(result, Err(SyncError::ChannelBroken(_))));
}

// ============================================================================
// Propagation
// ============================================================================

/// Test that a change made on one peer reaches the hub and the other peer.
#[tokio::test]
async fn test_peer_change_reaches_hub_and_other_peers() {
    let hub_dir = TempDir::new().unwrap();
    let peer_a = TempDir::new().unwrap();
    let peer_b = TempDir::new().unwrap();

    let (hub, port) = start_hub(hub_dir.path()).await;
    let watch_a = start_peer(peer_a.path(), port).await;
    let _watch_b = start_peer(peer_b.path(), port).await;
    wait_for_sessions(&hub, 2).await;

    std::fs::create_dir_all(peer_a.path().join("docs")).unwrap();
    std::fs::write(peer_a.path().join("docs/plan.md"), b"step one").unwrap();
    watch_a
        .send(WatchEvent::new(
            WatchKind::Modified,
            canonical(&peer_a).join("docs/plan.md"),
        ))
        .unwrap();

    let on_b = peer_b.path().join("docs/plan.md");
    eventually("peer b to receive the file", || {
        read(&on_b).as_deref() == Some(b"step one".as_slice())
    })
    .await;
    assert_eq!(read(hub_dir.path().join("docs/plan.md")).unwrap(), b"step one");

    hub.shutdown().await;
}

/// Test that a rename on one peer is replayed everywhere.
#[tokio::test]
async fn test_peer_move_is_replayed() {
    let hub_dir = TempDir::new().unwrap();
    std::fs::write(hub_dir.path().join("old.txt"), b"keep me").unwrap();
    let peer_a = TempDir::new().unwrap();
    let peer_b = TempDir::new().unwrap();

    let (hub, port) = start_hub(hub_dir.path()).await;
    let watch_a = start_peer(peer_a.path(), port).await;
    let _watch_b = start_peer(peer_b.path(), port).await;
    wait_for_sessions(&hub, 2).await;

    std::fs::create_dir_all(peer_a.path().join("archive")).unwrap();
    std::fs::rename(
        peer_a.path().join("old.txt"),
        peer_a.path().join("archive/old.txt"),
    )
    .unwrap();
    watch_a
        .send(WatchEvent::moved(
            canonical(&peer_a).join("old.txt"),
            canonical(&peer_a).join("archive/old.txt"),
        ))
        .unwrap();

    let moved = peer_b.path().join("archive/old.txt");
    eventually("peer b to replay the move", || moved.exists()).await;
    assert!(!peer_b.path().join("old.txt").exists());
    assert_eq!(read(hub_dir.path().join("archive/old.txt")).unwrap(), b"keep me");

    hub.shutdown().await;
}

/// Test that a change made on the hub itself reaches every peer.
#[tokio::test]
async fn test_hub_local_change_reaches_all_peers() {
    let hub_dir = TempDir::new().unwrap();
    let peers: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    let (hub, port) = start_hub(hub_dir.path()).await;
    let mut watchers = Vec::new();
    for peer in &peers {
        watchers.push(start_peer(peer.path(), port).await);
    }
    wait_for_sessions(&hub, 3).await;

    let (tx, rx) = mpsc::unbounded_channel();
    let watching = hub.clone();
    tokio::spawn(async move { watching.watch_local(rx).await });

    std::fs::write(hub_dir.path().join("announce.txt"), b"hello all").unwrap();
    tx.send(WatchEvent::new(
        WatchKind::Created,
        hub.tree().root().join("announce.txt"),
    ))
    .unwrap();

    for peer in &peers {
        let path = peer.path().join("announce.txt");
        eventually("every peer to receive the file", || {
            read(&path).as_deref() == Some(b"hello all".as_slice())
        })
        .await;
    }

    hub.shutdown().await;
}

/// Test that a deleted file disappears on the other peers.
#[tokio::test]
async fn test_peer_delete_is_replayed() {
    let hub_dir = TempDir::new().unwrap();
    std::fs::write(hub_dir.path().join("doomed.txt"), b"bye").unwrap();
    let peer_a = TempDir::new().unwrap();
    let peer_b = TempDir::new().unwrap();

    let (hub, port) = start_hub(hub_dir.path()).await;
    let watch_a = start_peer(peer_a.path(), port).await;
    let _watch_b = start_peer(peer_b.path(), port).await;
    wait_for_sessions(&hub, 2).await;

    std::fs::remove_file(peer_a.path().join("doomed.txt")).unwrap();
    watch_a
        .send(WatchEvent::new(
            WatchKind::Deleted,
            canonical(&peer_a).join("doomed.txt"),
        ))
        .unwrap();

    let on_b = peer_b.path().join("doomed.txt");
    eventually("peer b to delete the file", || !on_b.exists()).await;
    assert!(!hub_dir.path().join("doomed.txt").exists());

    hub.shutdown().await;
}

// ============================================================================
// Watcher
// ============================================================================

/// Test that the OS watcher reports a file written under the root.
#[tokio::test]
async fn test_local_watcher_reports_writes() {
    let dir = TempDir::new().unwrap();
    let root = std::fs::canonicalize(dir.path()).unwrap();
    let (_watcher, mut events) = LocalWatcher::start(&root).unwrap();

    std::fs::write(root.join("watched.txt"), b"data").unwrap();

    let target = root.join("watched.txt");
    let seen = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if event.path == target
                && matches!(event.kind, WatchKind::Created | WatchKind::Modified)
            {
                return true;
            }
        }
        false
    })
    .await;
    assert!(matches!(seen, Ok(true)), "no event for {}", target.display());
}

/// Test that renaming a file under the root is reported as one move, with
/// no delete of the source or creation of the destination before it.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_local_watcher_reports_rename_as_move() {
    let dir = TempDir::new().unwrap();
    let root = std::fs::canonicalize(dir.path()).unwrap();
    std::fs::write(root.join("old.txt"), b"content").unwrap();
    let (_watcher, mut events) = LocalWatcher::start(&root).unwrap();

    std::fs::rename(root.join("old.txt"), root.join("new.txt")).unwrap();

    let (from, to) = (root.join("old.txt"), root.join("new.txt"));
    let before_move = tokio::time::timeout(Duration::from_secs(10), async {
        let mut before = Vec::new();
        while let Some(event) = events.recv().await {
            if event.kind == WatchKind::Moved {
                assert_eq!(event.path, from);
                assert_eq!(event.dest_path.as_deref(), Some(to.as_path()));
                return Some((before, event));
            }
            before.push(event);
        }
        None
    })
    .await
    .unwrap();

    let (before, moved) = before_move.expect("watcher stream ended without a move");
    assert!(
        before.iter().all(|e| e.path != from && e.path != to),
        "rename leaked halves: {:?}",
        before
    );

    let tree = Arc::new(LocalTree::new(&root, IgnoreList::default(), Debouncer::default()));
    let change = ChangeDetector::new(tree).detect(moved).await;
    assert_eq!(
        change,
        Some(ChangeEvent::Moved {
            from: RelativePath::parse("old.txt").unwrap(),
            to: RelativePath::parse("new.txt").unwrap(),
        })
    );
}
