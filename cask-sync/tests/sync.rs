//! End-to-end tests of meta sync between connections on one hub.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use data_encoding::BASE64;
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};
use tracing_subscriber::{prelude::*, EnvFilter};

use cask_store::{MemLoader, RemoteMetaStore};
use cask_sync::{Connection, DownloadMetaParams, MemHub, SyncChannel, UploadMetaParams};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Remote meta store that records every applied batch.
#[derive(Debug, Default)]
struct RecordingMetaStore {
    batches: Mutex<Vec<Vec<Bytes>>>,
}

impl RecordingMetaStore {
    fn batches(&self) -> Vec<Vec<Bytes>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl RemoteMetaStore for RecordingMetaStore {
    async fn handle_byte_heads(&self, metas: Vec<Bytes>) -> Result<()> {
        self.batches.lock().push(metas);
        Ok(())
    }
}

fn connected_pair(hub: &MemHub) -> (Connection, Arc<RecordingMetaStore>) {
    let store = Arc::new(RecordingMetaStore::default());
    let loader = MemLoader::new().with_remote_meta(store.clone());
    let conn = Connection::new(Arc::new(hub.endpoint()), Arc::new(loader));
    (conn, store)
}

fn upload_params() -> UploadMetaParams {
    UploadMetaParams {
        name: "test-db".to_string(),
        branch: "main".to_string(),
    }
}

fn download_params() -> DownloadMetaParams {
    DownloadMetaParams {
        name: "test-db".to_string(),
        branch: "main".to_string(),
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within a second");
}

#[tokio::test]
async fn test_upload_applies_on_every_subscriber() {
    setup_logging();
    let hub = MemHub::new();
    let (conn_a, store_a) = connected_pair(&hub);
    let (conn_b, store_b) = connected_pair(&hub);

    conn_a
        .meta_upload(Bytes::from_static(b"head one"), &upload_params())
        .await
        .unwrap();

    // self-delivery: the uploader's own store is updated too
    wait_for(|| !store_a.batches().is_empty() && !store_b.batches().is_empty()).await;
    wait_for(|| {
        conn_a.task_manager().handled_len() == 1 && conn_b.task_manager().handled_len() == 1
    })
    .await;

    let expected = vec![vec![Bytes::from_static(b"head one")]];
    assert_eq!(store_a.batches(), expected);
    assert_eq!(store_b.batches(), expected);
}

#[tokio::test]
async fn test_own_upload_satisfies_own_download() {
    setup_logging();
    let hub = MemHub::new();
    let (conn, store) = connected_pair(&hub);
    // inbound metas land in the remote store behind the connection's loader
    assert!(conn.loader().remote_meta_store().is_some());
    let conn = Arc::new(conn);

    let download = tokio::spawn({
        let conn = conn.clone();
        async move { conn.meta_download(&download_params()).await }
    });
    // let the download subscribe before the upload goes out
    sleep(Duration::from_millis(50)).await;

    conn.meta_upload(Bytes::from_static(b"first head"), &upload_params())
        .await
        .unwrap();

    let metas = timeout(Duration::from_secs(1), download)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(metas, vec![Bytes::from_static(b"first head")]);

    // the same delivery is applied to the uploader's own store
    wait_for(|| !store.batches().is_empty()).await;
    wait_for(|| conn.task_manager().handled_len() == 1).await;
    assert_eq!(store.batches(), vec![vec![Bytes::from_static(b"first head")]]);
}

#[tokio::test]
async fn test_download_resolves_on_next_delivery() {
    setup_logging();
    let hub = MemHub::new();
    let (conn_a, _store_a) = connected_pair(&hub);
    let (conn_b, _store_b) = connected_pair(&hub);
    let conn_b = Arc::new(conn_b);

    let download = tokio::spawn({
        let conn = conn_b.clone();
        async move { conn.meta_download(&download_params()).await }
    });
    // let the download subscribe before anything is sent
    sleep(Duration::from_millis(50)).await;

    conn_a
        .meta_upload(Bytes::from_static(b"fresh head"), &upload_params())
        .await
        .unwrap();

    let metas = timeout(Duration::from_secs(1), download)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(metas, vec![Bytes::from_static(b"fresh head")]);

    // a new download arms for the next event, the one above does not satisfy it
    let pending = tokio::spawn({
        let conn = conn_b.clone();
        async move { conn.meta_download(&download_params()).await }
    });
    sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    conn_a
        .meta_upload(Bytes::from_static(b"newer head"), &upload_params())
        .await
        .unwrap();

    let metas = timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(metas, vec![Bytes::from_static(b"newer head")]);
}

#[tokio::test]
async fn test_chained_uploads_apply_child_once() {
    setup_logging();
    let hub = MemHub::new();
    let (conn_a, _store_a) = connected_pair(&hub);
    let (conn_b, store_b) = connected_pair(&hub);

    conn_a
        .meta_upload(Bytes::from_static(b"head one"), &upload_params())
        .await
        .unwrap();
    conn_a
        .meta_upload(Bytes::from_static(b"head two"), &upload_params())
        .await
        .unwrap();

    // the second event names the first as parent and retires it
    wait_for(|| conn_b.task_manager().handled_len() == 2).await;

    let applied: Vec<Bytes> = store_b.batches().into_iter().flatten().collect();
    assert!(!applied.is_empty());
    assert_eq!(applied.last().unwrap().as_ref(), b"head two");
    let children = applied.iter().filter(|m| m.as_ref() == b"head two").count();
    assert_eq!(children, 1);
    for meta in &applied {
        assert!(meta.as_ref() == b"head one" || meta.as_ref() == b"head two");
    }
}

#[tokio::test]
async fn test_malformed_messages_are_skipped() {
    setup_logging();
    let hub = MemHub::new();
    let (conn_b, store_b) = connected_pair(&hub);
    let raw = hub.endpoint();

    raw.send("not base64 at all!!!".to_string()).await.unwrap();
    raw.send(BASE64.encode(b"valid base64, junk cbor"))
        .await
        .unwrap();

    let (conn_a, _store_a) = connected_pair(&hub);
    conn_a
        .meta_upload(Bytes::from_static(b"survivor"), &upload_params())
        .await
        .unwrap();

    wait_for(|| !store_b.batches().is_empty()).await;
    wait_for(|| conn_b.task_manager().queue_len() == 0).await;
    assert_eq!(
        store_b.batches(),
        vec![vec![Bytes::from_static(b"survivor")]]
    );
}
