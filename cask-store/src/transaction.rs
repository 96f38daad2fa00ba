//! Write transactions.
//!
//! A [`CarTransaction`] is an isolated, append-only overlay of blocks staged
//! for one commit. Reads fall through to the parent store, so a transaction
//! sees everything the store sees plus its own staged blocks. The store keeps
//! every transaction it has opened; the transaction only holds a weak
//! reference back, so dropping the store ends delegated reads without leaking
//! a reference cycle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use parking_lot::RwLock;
use tracing::trace;

use crate::block::{Block, BlockFetcher};
use crate::error::StoreError;
use crate::store::StoreInner;

/// The staged blocks of one transaction.
#[derive(Debug, Default)]
pub(crate) struct TransactionInner {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl TransactionInner {
    /// Looks up a block in this transaction only, no fallthrough.
    pub(crate) fn raw_get(&self, cid: &Cid) -> Option<Block> {
        self.blocks
            .read()
            .get(cid)
            .map(|data| Block::new(*cid, data.clone()))
    }

    pub(crate) fn put(&self, cid: Cid, data: Bytes) -> Result<(), StoreError> {
        let mut blocks = self.blocks.write();
        if let Some(existing) = blocks.get(&cid) {
            if *existing != data {
                return Err(StoreError::HashConflict(cid));
            }
            return Ok(());
        }
        trace!(%cid, len = data.len(), "put");
        blocks.insert(cid, data);
        Ok(())
    }

    pub(crate) fn entries(&self) -> Vec<Block> {
        self.blocks
            .read()
            .iter()
            .map(|(cid, data)| Block::new(*cid, data.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.read().len()
    }
}

/// An open write transaction on an
/// [`EncryptedBlockstore`](crate::store::EncryptedBlockstore).
///
/// Cheaply cloneable; clones share the same staged blocks. Obtained through
/// [`EncryptedBlockstore::transaction`](crate::store::EncryptedBlockstore::transaction),
/// which passes the transaction into the caller's closure.
///
/// [`Loader::commit`](crate::loader::Loader::commit) receives the transaction
/// whose staged blocks make up the archive.
#[derive(Debug, Clone)]
pub struct CarTransaction {
    inner: Arc<TransactionInner>,
    parent: Weak<StoreInner>,
}

impl CarTransaction {
    pub(crate) fn new(inner: Arc<TransactionInner>, parent: Weak<StoreInner>) -> Self {
        Self { inner, parent }
    }

    /// Stages `data` under `cid`.
    ///
    /// Staging the same cid again with identical bytes is a no-op. Different
    /// bytes under an existing cid fail with [`StoreError::HashConflict`],
    /// since equal cids must mean equal bytes.
    pub fn put(&self, cid: Cid, data: Bytes) -> Result<(), StoreError> {
        self.inner.put(cid, data)
    }

    /// Stages a block.
    pub fn put_block(&self, block: Block) -> Result<(), StoreError> {
        self.put(block.cid, block.data)
    }

    /// Looks up a block: staged blocks first, then the parent store's full
    /// read path (all open transactions, then the loader).
    ///
    /// When the parent store has been dropped only the staged blocks remain
    /// visible.
    pub async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        if let Some(block) = self.inner.raw_get(cid) {
            return Ok(Some(block));
        }
        match self.parent.upgrade() {
            Some(store) => store.get(cid).await,
            None => Ok(None),
        }
    }

    /// Looks up a block in this transaction only, without consulting the
    /// parent store.
    pub fn raw_get(&self, cid: &Cid) -> Option<Block> {
        self.inner.raw_get(cid)
    }

    /// A snapshot of the staged blocks.
    pub fn entries(&self) -> impl Iterator<Item = Block> {
        self.inner.entries().into_iter()
    }

    /// Number of staged blocks.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no blocks have been staged yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlockFetcher for CarTransaction {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(CarTransaction::get(self, cid).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EncryptedBlockstore;

    #[tokio::test]
    async fn test_put_is_write_once() {
        let store = EncryptedBlockstore::new(None, None);
        let tx = store.new_transaction();

        let block = Block::from_data(&b"hello"[..]);
        assert!(tx.is_empty());
        tx.put_block(block.clone()).unwrap();
        assert_eq!(tx.len(), 1);
        assert!(!tx.is_empty());

        // same cid, same bytes: idempotent
        tx.put_block(block.clone()).unwrap();
        assert_eq!(tx.len(), 1);

        // same cid, different bytes: refused
        let err = tx.put(*block.cid(), Bytes::from_static(b"other")).unwrap_err();
        assert!(matches!(err, StoreError::HashConflict(cid) if cid == *block.cid()));
        assert_eq!(tx.raw_get(block.cid()).unwrap(), block);
    }

    #[tokio::test]
    async fn test_transactions_are_isolated() {
        let store = EncryptedBlockstore::new(None, None);
        let tx1 = store.new_transaction();
        let tx2 = store.new_transaction();

        let block = Block::from_data(&b"only in tx1"[..]);
        tx1.put_block(block.clone()).unwrap();

        // staged blocks stay private
        assert!(tx2.raw_get(block.cid()).is_none());
        assert_eq!(tx2.len(), 0);

        // but the full read path sees every open transaction
        let found = tx2.get(block.cid()).await.unwrap();
        assert_eq!(found, Some(block));
    }

    #[tokio::test]
    async fn test_get_after_store_drop() {
        let store = EncryptedBlockstore::new(None, None);
        let tx = store.new_transaction();
        let other = store.new_transaction();

        let mine = Block::from_data(&b"mine"[..]);
        let theirs = Block::from_data(&b"theirs"[..]);
        tx.put_block(mine.clone()).unwrap();
        other.put_block(theirs.clone()).unwrap();

        assert!(tx.get(theirs.cid()).await.unwrap().is_some());

        drop(store);
        drop(other);

        // without the parent only the own staged blocks remain
        assert_eq!(tx.get(mine.cid()).await.unwrap(), Some(mine));
        assert!(tx.get(theirs.cid()).await.unwrap().is_none());
    }
}
