//! Meta synchronization for cask stores over broadcast channels.
//!
//! This crate keeps replicas of a [`cask_store`] database pointing at the
//! same heads. Each commit's encrypted metadata is wrapped in a
//! content-addressed [`EventBlock`](event::EventBlock) that names its causal
//! parents, broadcast over a [`SyncChannel`](channel::SyncChannel), and
//! applied on every subscriber through a
//! [`TaskManager`](task_manager::TaskManager) that deduplicates ancestors
//! and serializes application.
//!
//! The entry point is [`Connection`](connection::Connection), which binds a
//! channel to a [`Loader`](cask_store::Loader). Archive contents never
//! travel over the channel, only metas do.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod connection;
pub mod error;
pub mod event;
pub mod metrics;
pub mod task_manager;

pub use self::channel::{MemChannel, MemHub, SyncChannel};
pub use self::connection::{
    Connection, DataKind, DownloadDataParams, DownloadMetaParams, UploadDataParams,
    UploadMetaParams,
};
pub use self::error::SyncError;
pub use self::event::{EventBlock, EventError};
pub use self::task_manager::TaskManager;
