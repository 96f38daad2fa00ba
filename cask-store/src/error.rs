//! Error types for the store.

use cid::Cid;

/// Errors for store and transaction operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Direct writes on the store are forbidden.
    #[error("use a transaction to put")]
    DirectWrite,
    /// The operation needs a [`Loader`](crate::loader::Loader) and none is attached.
    #[error("loader required to {0}")]
    LoaderRequired(&'static str),
    /// A block that must exist could not be found anywhere.
    #[error("missing block {0}")]
    MissingBlock(Cid),
    /// The loader did not produce a car descriptor for a committed transaction.
    #[error("failed to commit car")]
    CommitFailed,
    /// A cid was inserted twice with different payloads.
    #[error("conflicting data for block {0}")]
    HashConflict(Cid),
    /// Catchall for loader and closure failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    #[test]
    fn test_error_display() {
        assert_eq!(StoreError::DirectWrite.to_string(), "use a transaction to put");
        assert_eq!(
            StoreError::LoaderRequired("get file").to_string(),
            "loader required to get file"
        );
        assert_eq!(StoreError::CommitFailed.to_string(), "failed to commit car");

        let cid = *Block::from_data(&b"x"[..]).cid();
        assert_eq!(
            StoreError::MissingBlock(cid).to_string(),
            format!("missing block {cid}")
        );
    }
}
