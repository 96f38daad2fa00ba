//! The loader capability.
//!
//! A [`Loader`] is the store's durable side: it turns committed transactions
//! into content-addressed archives, serves blocks out of previously committed
//! archives, and optionally exposes a [`RemoteMetaStore`] through which
//! remotely produced metas are ingested. The store never touches archive
//! bytes itself, so details like the on-disk layout and payload encryption
//! live entirely behind this trait.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockFetcher};
use crate::transaction::CarTransaction;

/// Opaque serialized root descriptor of the database.
///
/// The store treats metas as bytes; producing and interpreting them is the
/// caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMeta(Bytes);

impl DbMeta {
    /// Wraps raw meta bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw meta bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Consumes the meta, returning the raw bytes.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for DbMeta {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for DbMeta {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for DbMeta {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

/// Describes one committed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarDescriptor {
    /// Content address of the archive.
    pub cid: Cid,
    /// Size of the archive in bytes.
    pub size: u64,
}

impl CarDescriptor {
    /// Creates a new descriptor.
    pub fn new(cid: Cid, size: u64) -> Self {
        Self { cid, size }
    }
}

/// Options for [`EncryptedBlockstore::transaction_with_opts`].
///
/// [`EncryptedBlockstore::transaction_with_opts`]: crate::store::EncryptedBlockstore::transaction_with_opts
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOpts {
    /// Skip the loader commit and return a result without a car descriptor.
    pub no_loader: bool,
}

/// Options passed to [`Loader::commit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOpts {
    /// Do not publish the commit beyond durable storage.
    pub no_loader: bool,
    /// Replace the archive log with this commit instead of appending to it.
    pub compact: bool,
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    /// The meta produced by the transaction closure.
    pub meta: DbMeta,
    /// Descriptor of the committed archive, `None` if the commit was skipped.
    pub car: Option<CarDescriptor>,
}

/// Durable storage capability behind an
/// [`EncryptedBlockstore`](crate::store::EncryptedBlockstore).
#[async_trait]
pub trait Loader: Send + Sync + Debug + 'static {
    /// Resolves once the loader is ready to serve requests.
    async fn ready(&self) -> Result<()>;

    /// Persists the blocks of `tx` together with `meta` as one archive.
    ///
    /// Returns the descriptor of the new archive. `Ok(None)` means the write
    /// was accepted but no descriptor could be produced; the store surfaces
    /// that as [`StoreError::CommitFailed`](crate::error::StoreError::CommitFailed).
    ///
    /// With `opts.compact` set the archive replaces the whole log instead of
    /// appending to it, and blocks not reachable from it may be dropped.
    async fn commit(
        &self,
        tx: &CarTransaction,
        meta: &DbMeta,
        opts: CommitOpts,
    ) -> Result<Option<CarDescriptor>>;

    /// Looks up a block in the committed archives.
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>>;

    /// Loads the archive addressed by `car` and returns a fetcher over its
    /// blocks. `public` marks archives stored without payload encryption.
    async fn load_file_car(&self, car: &Cid, public: bool) -> Result<Box<dyn BlockFetcher>>;

    /// The descriptors of all live archives, oldest first.
    fn car_log(&self) -> Vec<CarDescriptor>;

    /// The ingestion path for remotely produced metas, if any.
    fn remote_meta_store(&self) -> Option<Arc<dyn RemoteMetaStore>>;
}

/// Store-side ingestion of remotely produced metas.
#[async_trait]
pub trait RemoteMetaStore: Send + Sync + Debug + 'static {
    /// Applies a batch of serialized metas, in arrival order.
    async fn handle_byte_heads(&self, metas: Vec<Bytes>) -> Result<()>;
}
