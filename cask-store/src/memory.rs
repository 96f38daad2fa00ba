//! In-memory loader.
//!
//! [`MemLoader`] keeps committed archives as decoded blocks instead of real
//! car files, which is all tests and single-process embedders need. The
//! descriptor cid is a deterministic hash over the archive contents, so
//! committing the same blocks and meta twice yields the same descriptor.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use parking_lot::RwLock;
use tracing::debug;

use crate::block::{Block, BlockFetcher, RAW};
use crate::loader::{CarDescriptor, CommitOpts, DbMeta, Loader, RemoteMetaStore};
use crate::transaction::CarTransaction;

/// One committed archive.
#[derive(Debug, Clone)]
struct StoredCar {
    descriptor: CarDescriptor,
    blocks: Vec<Block>,
}

#[derive(Debug, Default)]
struct Inner {
    cars: Vec<StoredCar>,
    index: HashMap<Cid, Bytes>,
    remote_meta: Option<Arc<dyn RemoteMetaStore>>,
}

/// An in-memory [`Loader`].
///
/// Commits append to an archive log and merge the blocks into one index;
/// compacting commits replace both. Cheaply cloneable, clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemLoader {
    inner: Arc<RwLock<Inner>>,
}

impl MemLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the ingestion path for remotely produced metas.
    pub fn with_remote_meta(self, remote: Arc<dyn RemoteMetaStore>) -> Self {
        self.inner.write().remote_meta = Some(remote);
        self
    }

    /// Total number of blocks across all live archives.
    pub fn indexed_blocks(&self) -> usize {
        self.inner.read().index.len()
    }
}

/// Deterministic descriptor for an archive: SHA2-256 over the sorted block
/// cids followed by the meta bytes.
fn descriptor_for(blocks: &[Block], meta: &DbMeta) -> CarDescriptor {
    let mut cids: Vec<&Cid> = blocks.iter().map(|block| block.cid()).collect();
    cids.sort();
    let mut buf = Vec::new();
    for cid in cids {
        buf.extend_from_slice(&cid.to_bytes());
    }
    buf.extend_from_slice(meta.as_ref());
    let digest = Code::Sha2_256.digest(&buf);
    let size = blocks.iter().map(|block| block.data.len() as u64).sum::<u64>()
        + meta.as_ref().len() as u64;
    CarDescriptor::new(Cid::new_v1(RAW, digest), size)
}

#[async_trait]
impl Loader for MemLoader {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(
        &self,
        tx: &CarTransaction,
        meta: &DbMeta,
        opts: CommitOpts,
    ) -> Result<Option<CarDescriptor>> {
        let blocks: Vec<Block> = tx.entries().collect();
        let car = StoredCar {
            descriptor: descriptor_for(&blocks, meta),
            blocks,
        };

        let mut inner = self.inner.write();
        if opts.compact {
            inner.cars.clear();
            inner.index.clear();
        }
        for block in &car.blocks {
            inner.index.insert(*block.cid(), block.data.clone());
        }
        debug!(
            car = %car.descriptor.cid,
            blocks = car.blocks.len(),
            compact = opts.compact,
            "mem loader commit"
        );
        let descriptor = car.descriptor.clone();
        inner.cars.push(car);
        Ok(Some(descriptor))
    }

    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        let inner = self.inner.read();
        Ok(inner
            .index
            .get(cid)
            .map(|data| Block::new(*cid, data.clone())))
    }

    async fn load_file_car(&self, car: &Cid, _public: bool) -> Result<Box<dyn BlockFetcher>> {
        let inner = self.inner.read();
        let stored = inner
            .cars
            .iter()
            .find(|stored| stored.descriptor.cid == *car)
            .ok_or_else(|| anyhow!("unknown car {car}"))?;
        let blocks = stored
            .blocks
            .iter()
            .map(|block| (*block.cid(), block.data.clone()))
            .collect();
        Ok(Box::new(MemCarReader { blocks }))
    }

    fn car_log(&self) -> Vec<CarDescriptor> {
        self.inner
            .read()
            .cars
            .iter()
            .map(|car| car.descriptor.clone())
            .collect()
    }

    fn remote_meta_store(&self) -> Option<Arc<dyn RemoteMetaStore>> {
        self.inner.read().remote_meta.clone()
    }
}

/// Fetcher over the blocks of one loaded archive.
#[derive(Debug)]
struct MemCarReader {
    blocks: HashMap<Cid, Bytes>,
}

#[async_trait]
impl BlockFetcher for MemCarReader {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self
            .blocks
            .get(cid)
            .map(|data| Block::new(*cid, data.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EncryptedBlockstore;

    fn store_with_loader() -> (EncryptedBlockstore, MemLoader) {
        let loader = MemLoader::new();
        let store = EncryptedBlockstore::new(Some("mem".into()), Some(Arc::new(loader.clone())));
        (store, loader)
    }

    #[tokio::test]
    async fn test_commit_appends_and_indexes() {
        let (store, loader) = store_with_loader();

        let block1 = Block::from_data(&b"first"[..]);
        let put = block1.clone();
        let result = store
            .transaction(|tx| async move {
                tx.put_block(put)?;
                Ok(DbMeta::new(&b"meta-1"[..]))
            })
            .await
            .unwrap();
        let car1 = result.car.unwrap();

        let block2 = Block::from_data(&b"second"[..]);
        let put = block2.clone();
        store
            .transaction(|tx| async move {
                tx.put_block(put)?;
                Ok(DbMeta::new(&b"meta-2"[..]))
            })
            .await
            .unwrap();

        let log = loader.car_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], car1);
        assert_eq!(loader.indexed_blocks(), 2);

        // blocks from both archives resolve through the loader
        assert!(loader.get_block(block1.cid()).await.unwrap().is_some());
        assert!(loader.get_block(block2.cid()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_descriptor_is_deterministic() {
        let (store, _loader) = store_with_loader();
        let block = Block::from_data(&b"stable"[..]);

        let mut cars = Vec::new();
        for _ in 0..2 {
            let put = block.clone();
            let result = store
                .transaction(|tx| async move {
                    tx.put_block(put)?;
                    Ok(DbMeta::new(&b"same meta"[..]))
                })
                .await
                .unwrap();
            cars.push(result.car.unwrap());
        }
        assert_eq!(cars[0], cars[1]);
    }

    #[tokio::test]
    async fn test_load_file_car() {
        let (store, _loader) = store_with_loader();
        let block = Block::from_data(&b"file content"[..]);
        let put = block.clone();
        let result = store
            .transaction(|tx| async move {
                tx.put_block(put)?;
                Ok(DbMeta::new(&b"meta"[..]))
            })
            .await
            .unwrap();
        let car = result.car.unwrap();

        let data = store.get_file(&car.cid, block.cid(), false).await.unwrap();
        assert_eq!(data, block.data);

        // a cid outside the archive is missing, not silently absent
        let other = Block::from_data(&b"not in there"[..]);
        let err = store.get_file(&car.cid, other.cid(), false).await.unwrap_err();
        assert!(matches!(err, crate::error::StoreError::MissingBlock(cid) if cid == *other.cid()));

        // an unknown archive is an error
        let err = store.get_file(other.cid(), block.cid(), false).await.unwrap_err();
        assert!(matches!(err, crate::error::StoreError::Other(_)));
    }
}
