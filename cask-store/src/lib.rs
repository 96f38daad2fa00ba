//! Content-addressed transactional block storage.
//!
//! The storage core of an embedded, content-addressed, encrypted document
//! database. Blocks are immutable byte payloads addressed by the hash of
//! their content; all writes are staged in a [`CarTransaction`] and handed
//! to a [`Loader`] which persists them as one content-addressed archive per
//! commit. The store reads through every open transaction before falling
//! back to the loader, and can fold its archive log down to the live blocks
//! via [`EncryptedBlockstore::compact`].
//!
//! Durability, archive layout and payload encryption live behind the
//! [`Loader`] trait; [`MemLoader`] is the in-memory implementation used in
//! tests and single-process embedders.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod block;
pub mod error;
pub mod loader;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod transaction;

pub use self::block::{Block, BlockFetcher};
pub use self::error::StoreError;
pub use self::loader::{
    CarDescriptor, CommitOpts, DbMeta, Loader, RemoteMetaStore, TransactionMeta, TransactionOpts,
};
pub use self::memory::MemLoader;
pub use self::store::{CompactionFetcher, EncryptedBlockstore};
pub use self::transaction::CarTransaction;
