//! The blockstore.
//!
//! [`EncryptedBlockstore`] tracks every transaction it has opened and reads
//! through them before falling back to the attached [`Loader`]. All mutation
//! goes through [`EncryptedBlockstore::transaction`]; direct puts are
//! refused. Compaction re-walks the live graph through a
//! [`CompactionFetcher`] and commits exactly the blocks that walk touched.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use iroh_metrics::inc;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::block::{Block, BlockFetcher};
use crate::error::StoreError;
use crate::loader::{CommitOpts, DbMeta, Loader, TransactionMeta, TransactionOpts};
use crate::metrics::Metrics;
use crate::transaction::{CarTransaction, TransactionInner};

/// Shared state of a store.
///
/// Owns the open transactions strongly; transactions refer back weakly.
#[derive(Debug)]
pub(crate) struct StoreInner {
    name: Option<String>,
    loader: Option<Arc<dyn Loader>>,
    transactions: RwLock<Vec<Arc<TransactionInner>>>,
}

impl StoreInner {
    /// Full read path: every open transaction in registration order, then
    /// the loader.
    pub(crate) async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        inc!(Metrics, reads);
        {
            let transactions = self.transactions.read();
            for tx in transactions.iter() {
                if let Some(block) = tx.raw_get(cid) {
                    trace!(%cid, "read served from open transaction");
                    return Ok(Some(block));
                }
            }
        }
        if let Some(loader) = &self.loader {
            return Ok(loader.get_block(cid).await?);
        }
        Ok(None)
    }
}

/// A content-addressed blockstore with transactional writes.
///
/// Cheaply cloneable handle; clones share the same state. The store itself
/// holds no durable bytes, committed archives live behind the [`Loader`].
#[derive(Debug, Clone)]
pub struct EncryptedBlockstore {
    inner: Arc<StoreInner>,
}

impl EncryptedBlockstore {
    /// Creates a store. `name` only shows up in logs, `loader` is the
    /// durable side; without one the store is purely in-memory and commits
    /// are skipped.
    pub fn new(name: Option<String>, loader: Option<Arc<dyn Loader>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name,
                loader,
                transactions: Default::default(),
            }),
        }
    }

    /// The name of this store.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The attached loader.
    pub fn loader(&self) -> Option<&Arc<dyn Loader>> {
        self.inner.loader.as_ref()
    }

    /// Resolves once the attached loader is ready. A store without a loader
    /// is always ready.
    pub async fn ready(&self) -> Result<(), StoreError> {
        if let Some(loader) = &self.inner.loader {
            loader.ready().await?;
        }
        Ok(())
    }

    /// Opens a fresh transaction and registers it with the store.
    pub(crate) fn new_transaction(&self) -> CarTransaction {
        inc!(Metrics, transactions);
        let tx = Arc::new(TransactionInner::default());
        self.inner.transactions.write().push(tx.clone());
        CarTransaction::new(tx, Arc::downgrade(&self.inner))
    }

    /// Runs `f` inside a fresh transaction and commits the staged blocks
    /// through the loader.
    ///
    /// `f` receives the open transaction and returns the new [`DbMeta`]. On
    /// success the result carries the descriptor of the committed archive;
    /// without a loader the commit is skipped and `car` is `None`.
    ///
    /// A loader that accepts the write but returns no descriptor fails the
    /// call with [`StoreError::CommitFailed`]. The staged blocks have been
    /// handed over at that point: the write may be durable even though the
    /// acknowledgment was lost.
    pub async fn transaction<F, Fut>(&self, f: F) -> Result<TransactionMeta, StoreError>
    where
        F: FnOnce(CarTransaction) -> Fut,
        Fut: Future<Output = Result<DbMeta>>,
    {
        self.transaction_with_opts(TransactionOpts::default(), f)
            .await
    }

    /// Like [`Self::transaction`], with options.
    pub async fn transaction_with_opts<F, Fut>(
        &self,
        opts: TransactionOpts,
        f: F,
    ) -> Result<TransactionMeta, StoreError>
    where
        F: FnOnce(CarTransaction) -> Fut,
        Fut: Future<Output = Result<DbMeta>>,
    {
        let tx = self.new_transaction();
        let meta = f(tx.clone()).await.map_err(StoreError::Other)?;
        debug!(
            name = ?self.inner.name,
            blocks = tx.len(),
            no_loader = opts.no_loader,
            "transaction staged"
        );

        let loader = match &self.inner.loader {
            Some(loader) if !opts.no_loader => loader,
            _ => return Ok(TransactionMeta { meta, car: None }),
        };

        match loader.commit(&tx, &meta, CommitOpts::default()).await {
            Ok(Some(car)) => {
                inc!(Metrics, commits);
                debug!(car = %car.cid, size = car.size, "transaction committed");
                Ok(TransactionMeta {
                    meta,
                    car: Some(car),
                })
            }
            Ok(None) => {
                inc!(Metrics, commit_failures);
                Err(StoreError::CommitFailed)
            }
            Err(err) => {
                inc!(Metrics, commit_failures);
                Err(err.into())
            }
        }
    }

    /// Looks up a block across all open transactions, then the loader.
    ///
    /// A block that is nowhere to be found is `Ok(None)`, not an error.
    pub async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        self.inner.get(cid).await
    }

    /// Reads one block's payload out of the archive addressed by `car`.
    ///
    /// `public` marks archives stored without payload encryption. Fails with
    /// [`StoreError::MissingBlock`] if the archive does not contain `cid`.
    pub async fn get_file(&self, car: &Cid, cid: &Cid, public: bool) -> Result<Bytes, StoreError> {
        self.ready().await?;
        let loader = self
            .inner
            .loader
            .as_ref()
            .ok_or(StoreError::LoaderRequired("get file"))?;
        let reader = loader.load_file_car(car, public).await?;
        let block = reader
            .get(cid)
            .await?
            .ok_or(StoreError::MissingBlock(*cid))?;
        Ok(block.data)
    }

    /// Compacts the archive log down to the blocks reachable by `f`.
    ///
    /// `f` receives a [`CompactionFetcher`] and must re-derive the current
    /// meta through it, reading every block that is still live. The blocks
    /// that walk touched are committed as one archive which replaces the
    /// whole log. With fewer than two archives there is nothing to fold and
    /// the call is a no-op.
    pub async fn compact<F, Fut>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(CompactionFetcher) -> Fut,
        Fut: Future<Output = Result<DbMeta>>,
    {
        self.ready().await?;
        let loader = self
            .inner
            .loader
            .as_ref()
            .ok_or(StoreError::LoaderRequired("compact"))?;
        if loader.car_log().len() < 2 {
            debug!(name = ?self.inner.name, "compact skipped, nothing to fold");
            return Ok(());
        }

        let fetcher = CompactionFetcher::new(self);
        let meta = f(fetcher.clone()).await.map_err(StoreError::Other)?;
        let car = loader
            .commit(
                fetcher.logged(),
                &meta,
                CommitOpts {
                    compact: true,
                    no_loader: true,
                },
            )
            .await?;
        inc!(Metrics, compactions);
        debug!(
            name = ?self.inner.name,
            blocks = fetcher.logged().len(),
            car = ?car.map(|c| c.cid),
            "compacted"
        );
        Ok(())
    }

    /// All blocks staged in open transactions, deduplicated by cid. The
    /// first occurrence in registration order wins.
    pub fn entries(&self) -> impl Iterator<Item = Block> {
        let transactions = self.inner.transactions.read();
        let mut seen = HashSet::new();
        let mut blocks = Vec::new();
        for tx in transactions.iter() {
            for block in tx.entries() {
                if seen.insert(*block.cid()) {
                    blocks.push(block);
                }
            }
        }
        blocks.into_iter()
    }

    /// Direct writes are forbidden, this always fails with
    /// [`StoreError::DirectWrite`]. Stage blocks through
    /// [`Self::transaction`] instead.
    pub fn put(&self, _cid: Cid, _data: Bytes) -> Result<(), StoreError> {
        Err(StoreError::DirectWrite)
    }

    /// Number of transactions this store has opened.
    pub fn open_transactions(&self) -> usize {
        self.inner.transactions.read().len()
    }
}

#[async_trait]
impl BlockFetcher for EncryptedBlockstore {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(EncryptedBlockstore::get(self, cid).await?)
    }
}

/// A block source that records everything it serves.
///
/// Used by [`EncryptedBlockstore::compact`]: the caller walks the live graph
/// through this fetcher, and the recorded blocks become the replacement
/// archive. Blocks never read are left behind.
#[derive(Debug, Clone)]
pub struct CompactionFetcher {
    store: EncryptedBlockstore,
    logged: CarTransaction,
}

impl CompactionFetcher {
    pub(crate) fn new(store: &EncryptedBlockstore) -> Self {
        Self {
            store: store.clone(),
            logged: store.new_transaction(),
        }
    }

    /// Looks up a block through the store and records it as live.
    pub async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        let block = self.store.get(cid).await?;
        if let Some(block) = &block {
            self.logged.put(*block.cid(), block.data.clone())?;
        }
        Ok(block)
    }

    /// The transaction holding every block served so far.
    pub fn logged(&self) -> &CarTransaction {
        &self.logged
    }
}

#[async_trait]
impl BlockFetcher for CompactionFetcher {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(CompactionFetcher::get(self, cid).await?)
    }
}
