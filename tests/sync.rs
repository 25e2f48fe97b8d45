//! End-to-end scenarios driving two participants through the public API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gridfolder::grid::MemGrid;
use gridfolder::{membership, FolderService, GridClient, ServiceConfig, Store};

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> ServiceConfig {
    ServiceConfig {
        debounce: Duration::from_millis(100),
        reconcile_interval: Duration::from_millis(200),
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
    }
}

/// Polls `predicate` until it holds or the timeout expires.
async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn file_equals(path: &Path, expected: &[u8]) -> bool {
    std::fs::read(path).map(|c| c == expected).unwrap_or(false)
}

struct Participant {
    _dir: tempfile::TempDir,
    root: PathBuf,
    store: Store,
    service: FolderService,
}

async fn start_alice(grid: &MemGrid) -> Participant {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("magic");
    let store = Store::open(dir.path().join("ledger.redb")).unwrap();
    membership::create(grid, &store, "alice", root.clone())
        .await
        .unwrap();
    let service =
        FolderService::start(Arc::new(grid.clone()), store.clone(), test_config()).unwrap();
    Participant {
        _dir: dir,
        root,
        store,
        service,
    }
}

async fn join_as(grid: &MemGrid, alice: &Participant, nickname: &str) -> Participant {
    let token = membership::invite(grid, &alice.store, nickname)
        .await
        .unwrap();
    // the token travels as a string between the participants
    let token = token.to_string().parse().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("magic");
    let store = Store::open(dir.path().join("ledger.redb")).unwrap();
    membership::join(&store, &token, root.clone(), nickname).unwrap();
    let service =
        FolderService::start(Arc::new(grid.clone()), store.clone(), test_config()).unwrap();
    Participant {
        _dir: dir,
        root,
        store,
        service,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_participants_converge() {
    setup_logging();
    let grid = MemGrid::new();
    let alice = start_alice(&grid).await;

    // alice writes a file; her pipeline publishes it
    std::fs::create_dir_all(&alice.root).unwrap();
    std::fs::write(alice.root.join("notes.txt"), "v1").unwrap();

    let bob = join_as(&grid, &alice, "bob").await;

    // bob's reconciler materializes alice's file byte-identically
    let bob_notes = bob.root.join("notes.txt");
    wait_until("bob to receive notes.txt", || {
        file_equals(&bob_notes, b"v1")
    })
    .await;
    let record = bob.store.get("notes.txt").unwrap().unwrap();
    assert_eq!(record.version, 1);

    // alice edits; bob follows without re-uploading anything himself
    std::fs::write(alice.root.join("notes.txt"), "v2").unwrap();
    wait_until("bob to receive the edit", || file_equals(&bob_notes, b"v2")).await;
    let record = bob.store.get("notes.txt").unwrap().unwrap();
    assert_eq!(record.version, 2);
    let bob_personal = bob.service.membership().personal_write_cap;
    assert!(grid
        .list(&bob_personal)
        .await
        .unwrap()
        .is_empty());

    // bob writes a file of his own; alice receives it
    std::fs::write(bob.root.join("reply.txt"), "hi alice").unwrap();
    let alice_reply = alice.root.join("reply.txt");
    wait_until("alice to receive reply.txt", || {
        file_equals(&alice_reply, b"hi alice")
    })
    .await;

    let status = alice.service.status().unwrap();
    assert_eq!(status.conflict_count, 0);
    assert!(!status.degraded);
    assert!(status.last_sync_time.is_some());

    alice.service.shutdown(true).await;
    bob.service.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changes_made_while_stopped_are_picked_up_on_restart() {
    setup_logging();
    let grid = MemGrid::new();
    let alice = start_alice(&grid).await;
    let personal = alice.service.membership().personal_write_cap;
    alice.service.shutdown(true).await;

    // edited while no service was running
    std::fs::create_dir_all(&alice.root).unwrap();
    std::fs::write(alice.root.join("offline.txt"), "written offline").unwrap();

    let service =
        FolderService::start(Arc::new(grid.clone()), alice.store.clone(), test_config()).unwrap();

    // the startup rescan feeds the file through the normal pipeline
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let published = grid
            .list(&personal)
            .await
            .map(|entries| entries.iter().any(|e| e.name == "offline.txt"))
            .unwrap_or(false);
        if published {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for the startup rescan to publish the file");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    service.shutdown(true).await;
}
