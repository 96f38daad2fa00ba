//! Metrics for cask-store

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Metrics for cask-store
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub transactions: Counter,
    pub commits: Counter,
    pub commit_failures: Counter,
    pub compactions: Counter,
    pub reads: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            transactions: Counter::new("Number of transactions opened"),
            commits: Counter::new("Number of transactions committed through the loader"),
            commit_failures: Counter::new("Number of commits that failed or lost the descriptor"),
            compactions: Counter::new("Number of completed compactions"),
            reads: Counter::new("Number of block reads served by the store"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "cask_store"
    }
}
