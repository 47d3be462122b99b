//! End-to-end sync tests: real signal server, real StoreManagers, real
//! WebSocket pipes between them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tandem::document::ROOT_MAP;
use tandem::yrs::{Map, TransactionMut, WriteTxn};
use tandem::{
    Action, DispatchOutcome, Proposal, Reducer, SignalConfig, SignalServer, SignalServerHandle,
    StoreConfig, StoreEvent, StoreManager,
};

fn set_reducer() -> Arc<dyn Reducer> {
    Arc::new(|action: &Action| match action.name.as_str() {
        "set" => {
            let key = action.payload["key"].as_str().unwrap_or("value").to_string();
            let value = action.payload["value"].as_i64().unwrap_or(0);
            Proposal::Handled(Box::new(move |txn: &mut TransactionMut| {
                let root = txn.get_or_insert_map(ROOT_MAP);
                root.insert(txn, key.as_str(), value);
            }))
        }
        _ => Proposal::NotHandled,
    })
}

async fn start_signal() -> SignalServerHandle {
    SignalServer::bind(SignalConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        pairing_timeout: Duration::from_secs(5),
    })
    .await
    .unwrap()
}

fn manager(database_name: &str, signal_url: &str) -> StoreManager {
    manager_with_storage(database_name, signal_url, None)
}

fn manager_with_storage(
    database_name: &str,
    signal_url: &str,
    storage_dir: Option<std::path::PathBuf>,
) -> StoreManager {
    let config = StoreConfig {
        database_name: database_name.to_string(),
        signal_urls: vec![signal_url.to_string()],
        storage_dir,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(500),
        ..StoreConfig::default()
    };
    StoreManager::new(config, json!({}), set_reducer())
}

fn set(manager: &StoreManager, document_id: &str, key: &str, value: i64) {
    let outcome = manager
        .dispatch(&Action {
            document_id: document_id.to_string(),
            name: "set".to_string(),
            payload: json!({ "key": key, "value": value }),
        })
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Applied);
}

fn snapshot(manager: &StoreManager, document_id: &str) -> Value {
    manager.get_document(document_id).unwrap().snapshot()
}

/// Poll until the condition holds; panic after five seconds.
async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_two_peers_one_edit() {
    let signal = start_signal().await;

    let alice = manager("app", &signal.url());
    alice.create_store("doc-1").unwrap();
    set(&alice, "doc-1", "x", 1);

    let bob = manager("app", &signal.url());
    bob.join_store("doc-1").unwrap();

    wait_for("bob to receive the edit", || {
        snapshot(&bob, "doc-1") == json!({ "x": 1 })
    })
    .await;

    assert_eq!(alice.connection_count(), 1);
    assert_eq!(bob.connection_count(), 1);
    assert_eq!(
        alice.get_document("doc-1").unwrap().clock(),
        bob.get_document("doc-1").unwrap().clock()
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let signal = start_signal().await;

    let alice = manager("app", &signal.url());
    alice.create_store("doc-1").unwrap();
    let bob = manager("app", &signal.url());
    bob.join_store("doc-1").unwrap();

    wait_for("peers to pair", || {
        alice.connection_count() == 1 && bob.connection_count() == 1
    })
    .await;

    set(&alice, "doc-1", "x", 1);
    set(&bob, "doc-1", "y", 2);

    wait_for("both replicas to converge", || {
        let expected = json!({ "x": 1, "y": 2 });
        snapshot(&alice, "doc-1") == expected && snapshot(&bob, "doc-1") == expected
    })
    .await;

    assert_eq!(
        alice.get_document("doc-1").unwrap().clock(),
        bob.get_document("doc-1").unwrap().clock()
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_three_way_convergence() {
    let signal = start_signal().await;

    let alice = manager("app", &signal.url());
    alice.create_store("doc-1").unwrap();
    let bob = manager("app", &signal.url());
    bob.join_store("doc-1").unwrap();
    let carol = manager("app", &signal.url());
    carol.join_store("doc-1").unwrap();

    wait_for("full mesh", || {
        alice.connection_count() == 2
            && bob.connection_count() == 2
            && carol.connection_count() == 2
    })
    .await;

    set(&alice, "doc-1", "counter", 1);
    set(&bob, "doc-1", "counter", 2);
    set(&carol, "doc-1", "counter", 3);

    wait_for("three-way convergence", || {
        let a = snapshot(&alice, "doc-1");
        let b = snapshot(&bob, "doc-1");
        let c = snapshot(&carol, "doc-1");
        a == b && b == c && a.get("counter").is_some()
    })
    .await;

    let clock = alice.get_document("doc-1").unwrap().clock();
    assert_eq!(clock, bob.get_document("doc-1").unwrap().clock());
    assert_eq!(clock, carol.get_document("doc-1").unwrap().clock());

    alice.close().await;
    bob.close().await;
    carol.close().await;
}

#[tokio::test]
async fn test_reconnect_catches_up_from_local_state() {
    let signal = start_signal().await;
    let dir = tempfile::tempdir().unwrap();

    let alice = manager("app", &signal.url());
    alice.create_store("doc-1").unwrap();
    set(&alice, "doc-1", "x", 1);

    {
        let bob = manager_with_storage("app", &signal.url(), Some(dir.path().into()));
        bob.join_store("doc-1").unwrap();
        wait_for("initial sync", || snapshot(&bob, "doc-1") == json!({ "x": 1 })).await;
        bob.close().await;
    }

    wait_for("alice to notice the disconnect", || {
        alice.connection_count() == 0
    })
    .await;

    // Five edits while bob is away.
    for i in 1..=5 {
        set(&alice, "doc-1", "n", i);
    }

    let bob = manager_with_storage("app", &signal.url(), Some(dir.path().into()));
    bob.join_store("doc-1").unwrap();
    // Local recovery happens before any peer traffic.
    assert_eq!(snapshot(&bob, "doc-1")["x"], json!(1));

    wait_for("bob to catch up", || {
        snapshot(&bob, "doc-1") == json!({ "x": 1, "n": 5 })
    })
    .await;
    assert_eq!(
        alice.get_document("doc-1").unwrap().clock(),
        bob.get_document("doc-1").unwrap().clock()
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_peer_events_follow_lifecycle() {
    let signal = start_signal().await;

    let alice = manager("app", &signal.url());
    alice.create_store("doc-1").unwrap();

    let peers = Arc::new(AtomicUsize::new(0));
    let removals = Arc::new(AtomicUsize::new(0));
    let changed = Arc::new(Mutex::new(Vec::new()));
    {
        let peers = peers.clone();
        let removals = removals.clone();
        let changed = changed.clone();
        alice.on(Arc::new(move |event| match event {
            StoreEvent::Peer { .. } => {
                peers.fetch_add(1, Ordering::SeqCst);
            }
            StoreEvent::PeerRemove { .. } => {
                removals.fetch_add(1, Ordering::SeqCst);
            }
            StoreEvent::Change { document_id } => {
                changed.lock().unwrap().push(document_id.clone());
            }
            _ => {}
        }));
    }

    let bob = manager("app", &signal.url());
    bob.join_store("doc-1").unwrap();

    wait_for("peer event", || peers.load(Ordering::SeqCst) == 1).await;

    set(&bob, "doc-1", "x", 7);
    wait_for("change event from remote edit", || {
        changed.lock().unwrap().contains(&"doc-1".to_string())
    })
    .await;

    bob.close().await;
    wait_for("peer-remove event", || removals.load(Ordering::SeqCst) == 1).await;
    assert_eq!(alice.connection_count(), 0);

    alice.close().await;
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let signal = start_signal().await;

    let alice = manager("app", &signal.url());
    alice.create_store("doc-a").unwrap();
    set(&alice, "doc-a", "x", 1);

    let bob = manager("app", &signal.url());
    bob.join_store("doc-b").unwrap();

    // No shared document: no pairing, no data flow.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(alice.connection_count(), 0);
    assert_eq!(bob.connection_count(), 0);
    assert_eq!(snapshot(&bob, "doc-b"), json!({}));

    alice.close().await;
    bob.close().await;
}
