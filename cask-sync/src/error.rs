//! Error types for the sync layer.

use crate::event::EventError;

/// Errors returned by [`Connection`] operations.
///
/// [`Connection`]: crate::connection::Connection
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A parameter failed validation. Nothing was sent.
    #[error("{0}")]
    Validation(&'static str),
    /// The operation is part of the connection contract but this connection
    /// does not provide it.
    #[error("not implemented")]
    NotImplemented,
    /// Encoding or decoding an event block failed.
    #[error(transparent)]
    Event(#[from] EventError),
    /// The underlying channel failed.
    #[error("channel: {0}")]
    Channel(#[source] anyhow::Error),
}
