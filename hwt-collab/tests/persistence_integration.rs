//! Relay persistence: sessions restored from the file log store after a
//! restart, for both the in-process relay and the WebSocket server.

use std::time::Duration;
use tokio::time::sleep;

use hwt_collab::client::{ClientConfig, WsTransport};
use hwt_collab::server::{RelayServer, ServerConfig};
use hwt_collab::storage::{shared, FileStoreConfig, LogStore};
use hwt_collab::{
    spawn_engine, DocumentId, EngineConfig, EngineHandle, FieldValue, FileLogStore, LinkState,
    LocalRelay, RelayConfig, SiteId, SyncEngine,
};

async fn wait_for<F>(handle: &EngineHandle, what: &str, check: F)
where
    F: Fn(&SyncEngine) -> bool + Send + Sync + Clone + 'static,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let check = check.clone();
        if handle.inspect(move |e| check(e)).await.unwrap() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn engine(doc: DocumentId, site: u128) -> SyncEngine {
    SyncEngine::new(doc, SiteId::from_u128(site), EngineConfig::for_testing())
}

#[tokio::test]
async fn test_local_relay_restores_from_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DocumentId::new();

    let expected = {
        let store = FileLogStore::open(FileStoreConfig::for_testing(dir.path())).unwrap();
        let relay = LocalRelay::with_store(RelayConfig::for_testing(), Some(shared(store)));
        let a = spawn_engine(engine(doc, 1), relay.connect()).unwrap();
        wait_for(&a, "a live", |e| e.state() == LinkState::Live).await;

        let mut targets = Vec::new();
        for i in 0..12 {
            targets.push(a.insert([("n", FieldValue::from(i as i64))]).await.unwrap().target);
        }
        a.delete(targets[3]).await.unwrap();
        wait_for(&a, "acks", |e| e.in_flight() == 0 && e.cursor() == 13).await;

        let state = a.list_elements(true).await.unwrap();
        a.shutdown().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while relay.hub().session_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "session was not closed");
            sleep(Duration::from_millis(10)).await;
        }
        state
    };

    // The log and final checkpoint are on disk.
    {
        let store = FileLogStore::open(FileStoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.head(doc).unwrap(), 13);
        assert_eq!(store.load_checkpoint(doc).unwrap().unwrap().seq, 13);
    }

    let store = FileLogStore::open(FileStoreConfig::for_testing(dir.path())).unwrap();
    let relay = LocalRelay::with_store(RelayConfig::for_testing(), Some(shared(store)));
    let b = spawn_engine(engine(doc, 2), relay.connect()).unwrap();
    wait_for(&b, "b restored", |e| e.cursor() == 13).await;
    assert_eq!(b.list_elements(true).await.unwrap(), expected);
    assert_eq!(b.list_elements(false).await.unwrap().len(), 11);
}

#[tokio::test]
async fn test_websocket_server_restart_keeps_history() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DocumentId::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        storage_path: Some(dir.path().to_path_buf()),
        relay: RelayConfig::for_testing(),
        ..ServerConfig::default()
    };

    let first = RelayServer::new(config.clone()).unwrap();
    let server = tokio::spawn(async move {
        let _ = first.serve(listener).await;
    });

    let a = spawn_engine(engine(doc, 1), WsTransport::spawn(ClientConfig::for_testing(&url))).unwrap();
    wait_for(&a, "a live", |e| e.state() == LinkState::Live).await;
    let target = a.insert([("ref", FieldValue::text("J1"))]).await.unwrap().target;
    a.update(target, "pins", FieldValue::from(40i64)).await.unwrap();
    wait_for(&a, "acks", |e| e.cursor() == 2).await;
    a.shutdown().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    server.abort();
    sleep(Duration::from_millis(50)).await;

    let second = RelayServer::new(config).unwrap();
    tokio::spawn(async move {
        let _ = second.run().await;
    });
    sleep(Duration::from_millis(50)).await;

    let b = spawn_engine(engine(doc, 2), WsTransport::spawn(ClientConfig::for_testing(&url))).unwrap();
    wait_for(&b, "b caught up", move |e| {
        e.get(&target).and_then(|el| el.get("pins").cloned()) == Some(FieldValue::from(40i64))
    })
    .await;
}
