//! Content-addressed blocks.
//!
//! A [`Block`] is the unit everything else in this crate moves around: an
//! immutable byte payload together with the [`Cid`] derived from those bytes.
//! Equal payloads always produce equal CIDs, so blocks can be deduplicated
//! and verified by address alone.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;

/// Multicodec code for raw bytes.
pub(crate) const RAW: u64 = 0x55;

/// A wrapper around bytes with their `Cid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The content address of `data`.
    pub cid: Cid,
    /// The payload.
    pub data: Bytes,
}

impl Block {
    /// Creates a block from a precomputed `Cid` and its payload.
    ///
    /// The caller is responsible for `cid` actually addressing `data`. Blocks
    /// built from untrusted sources should go through [`Block::from_data`] or
    /// be verified before use.
    pub fn new(cid: Cid, data: Bytes) -> Self {
        Self { cid, data }
    }

    /// Creates a block by hashing `data` with SHA2-256 into a CIDv1 raw cid.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let digest = Code::Sha2_256.digest(&data);
        let cid = Cid::new_v1(RAW, digest);
        Self { cid, data }
    }

    /// The cid of this block.
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// The payload of this block.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Anything that can resolve a cid to a block.
///
/// Implemented by transactions, stores and compaction fetchers. `Ok(None)`
/// means the implementor does not know the block, errors are reserved for
/// lookups that failed outright.
#[async_trait]
pub trait BlockFetcher: Send + Sync + Debug + 'static {
    /// Looks up the block addressed by `cid`.
    async fn get(&self, cid: &Cid) -> Result<Option<Block>>;
}

#[async_trait]
impl<T: BlockFetcher> BlockFetcher for Arc<T> {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        self.as_ref().get(cid).await
    }
}
