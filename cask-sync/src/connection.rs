//! Meta sync connections.
//!
//! A [`Connection`] binds a [`SyncChannel`] to a [`Loader`]. Outbound metas
//! are wrapped in [`EventBlock`]s naming the previous upload as parent and
//! broadcast base64-encoded. Inbound messages are decoded, causally
//! deduplicated through the [`TaskManager`] and applied to the loader's
//! remote meta store; the newest inbound batch is also parked in a watch
//! slot so [`Connection::meta_download`] can await the next delivery.
//!
//! Data uploads and downloads are part of the connection contract but this
//! connection is meta-only, those operations validate their parameters and
//! return [`SyncError::NotImplemented`].

use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use cid::Cid;
use data_encoding::BASE64;
use iroh_metrics::inc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error_span, warn, Instrument};

use cask_store::Loader;

use crate::channel::SyncChannel;
use crate::error::SyncError;
use crate::event::{EventBlock, EventError};
use crate::metrics::Metrics;
use crate::task_manager::TaskManager;

/// Parameters for [`Connection::meta_upload`].
#[derive(Debug, Clone)]
pub struct UploadMetaParams {
    /// Database name.
    pub name: String,
    /// Meta branch, usually `"main"`.
    pub branch: String,
}

/// Parameters for [`Connection::meta_download`].
#[derive(Debug, Clone)]
pub struct DownloadMetaParams {
    /// Database name.
    pub name: String,
    /// Meta branch, usually `"main"`.
    pub branch: String,
}

/// What a data payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// An ordinary archive.
    Data,
    /// A file attachment archive.
    File,
}

/// Parameters for [`Connection::data_upload`].
#[derive(Debug, Clone)]
pub struct UploadDataParams {
    /// Database name.
    pub name: String,
    /// Archive identifier.
    pub car: String,
    /// Payload kind.
    pub kind: DataKind,
    /// Payload size in bytes.
    pub size: u64,
}

/// Parameters for [`Connection::data_download`].
#[derive(Debug, Clone)]
pub struct DownloadDataParams {
    /// Database name.
    pub name: String,
    /// Archive identifier.
    pub car: String,
    /// Payload kind.
    pub kind: DataKind,
}

fn validate_meta_params(name: &str, branch: &str) -> Result<(), SyncError> {
    if name.is_empty() {
        return Err(SyncError::Validation("name is required"));
    }
    if branch.is_empty() {
        return Err(SyncError::Validation("branch is required"));
    }
    Ok(())
}

fn validate_data_params(name: &str, car: &str) -> Result<(), SyncError> {
    if name.is_empty() {
        return Err(SyncError::Validation("name is required"));
    }
    if car.is_empty() {
        return Err(SyncError::Validation("car is required"));
    }
    Ok(())
}

/// Wraps a join handle, aborting the task when dropped.
#[derive(Debug)]
struct AbortingJoinHandle<T> {
    handle: JoinHandle<T>,
}

impl<T> From<JoinHandle<T>> for AbortingJoinHandle<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T> Drop for AbortingJoinHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A meta sync connection over a broadcast channel.
///
/// The connection subscribes to the channel on construction and keeps a
/// receive loop running until dropped. Every subscriber of the channel sees
/// every upload, the uploader included, so local commits flow through the
/// same inbound path as remote ones.
#[derive(Debug)]
pub struct Connection {
    channel: Arc<dyn SyncChannel>,
    loader: Arc<dyn Loader>,
    task_manager: TaskManager,
    inbound: Arc<watch::Sender<Vec<Bytes>>>,
    parents: Mutex<Vec<Cid>>,
    _recv_task: AbortingJoinHandle<()>,
}

impl Connection {
    /// Opens a connection: subscribes to `channel` and starts the receive
    /// loop applying inbound metas to `loader`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(channel: Arc<dyn SyncChannel>, loader: Arc<dyn Loader>) -> Self {
        let task_manager = TaskManager::new();
        let (inbound, _) = watch::channel(Vec::new());
        let inbound = Arc::new(inbound);
        let messages = channel.subscribe();
        let recv_task = tokio::spawn(
            recv_loop(
                messages,
                loader.clone(),
                task_manager.clone(),
                inbound.clone(),
            )
            .instrument(error_span!("sync-recv")),
        );
        Self {
            channel,
            loader,
            task_manager,
            inbound,
            parents: Mutex::new(Vec::new()),
            _recv_task: recv_task.into(),
        }
    }

    /// Broadcasts `meta` as an event block.
    ///
    /// The event names the cids of the previous successful upload as its
    /// parents; on success the parent list is replaced by this event's cid,
    /// so consecutive uploads form a chain. A failed send leaves the parent
    /// list untouched.
    pub async fn meta_upload(
        &self,
        meta: Bytes,
        params: &UploadMetaParams,
    ) -> Result<(), SyncError> {
        validate_meta_params(&params.name, &params.branch)?;
        self.channel.ready().await.map_err(SyncError::Channel)?;

        let parents = self.parents.lock().clone();
        let event = EventBlock::new(meta, parents)?;
        let msg = BASE64.encode(event.bytes());
        self.channel.send(msg).await.map_err(SyncError::Channel)?;

        *self.parents.lock() = vec![*event.cid()];
        inc!(Metrics, meta_uploads);
        debug!(cid = %event.cid(), db = %params.name, "meta upload");
        Ok(())
    }

    /// Waits for the next inbound meta batch.
    ///
    /// One-shot: resolves with the metas of the first event delivered after
    /// the call, whoever sent it. Call again to wait for the one after that.
    pub async fn meta_download(
        &self,
        params: &DownloadMetaParams,
    ) -> Result<Vec<Bytes>, SyncError> {
        validate_meta_params(&params.name, &params.branch)?;
        inc!(Metrics, meta_downloads);

        let mut slot = self.inbound.subscribe();
        slot.changed()
            .await
            .map_err(|_| SyncError::Channel(anyhow!("receive loop gone")))?;
        let metas = slot.borrow().clone();
        Ok(metas)
    }

    /// Uploads an archive. Not provided by this connection.
    pub async fn data_upload(
        &self,
        _data: Bytes,
        params: &UploadDataParams,
    ) -> Result<(), SyncError> {
        validate_data_params(&params.name, &params.car)?;
        Err(SyncError::NotImplemented)
    }

    /// Downloads an archive. Not provided by this connection.
    pub async fn data_download(
        &self,
        params: &DownloadDataParams,
    ) -> Result<Option<Bytes>, SyncError> {
        validate_data_params(&params.name, &params.car)?;
        Err(SyncError::NotImplemented)
    }

    /// Hooks the connection up as a remote data store. Not provided by this
    /// connection.
    pub async fn connect_storage(&self) -> Result<(), SyncError> {
        Err(SyncError::NotImplemented)
    }

    /// The parent cids the next upload will name.
    pub fn parents(&self) -> Vec<Cid> {
        self.parents.lock().clone()
    }

    /// The task manager deduplicating inbound events.
    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    /// The loader inbound metas are applied to.
    pub fn loader(&self) -> &Arc<dyn Loader> {
        &self.loader
    }
}

/// Receive loop: runs until the channel closes or the connection is dropped.
///
/// A message that fails to decode or apply is logged and skipped, one bad
/// sender cannot wedge the subscription.
async fn recv_loop(
    mut messages: mpsc::Receiver<String>,
    loader: Arc<dyn Loader>,
    task_manager: TaskManager,
    inbound: Arc<watch::Sender<Vec<Bytes>>>,
) {
    while let Some(msg) = messages.recv().await {
        if let Err(err) = handle_message(msg, &loader, &task_manager, &inbound).await {
            inc!(Metrics, recv_failures);
            warn!("failed to handle inbound message: {err:#}");
        }
    }
    debug!("channel closed, receive loop ending");
}

async fn handle_message(
    msg: String,
    loader: &Arc<dyn Loader>,
    task_manager: &TaskManager,
    inbound: &watch::Sender<Vec<Bytes>>,
) -> Result<()> {
    let bytes = BASE64
        .decode(msg.as_bytes())
        .map_err(EventError::InvalidBase64)?;
    let event = EventBlock::decode(bytes)?;
    loader.ready().await?;
    debug!(cid = %event.cid(), "inbound event");
    let db_meta = event.db_meta().clone();
    task_manager.handle_event(event, loader.clone());
    inbound.send_replace(vec![db_meta]);
    Ok(())
}
