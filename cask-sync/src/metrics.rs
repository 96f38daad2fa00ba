//! Metrics for cask-sync.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Metrics for cask-sync.
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub meta_uploads: Counter,
    pub meta_downloads: Counter,
    pub events_received: Counter,
    pub events_deduped: Counter,
    pub drains: Counter,
    pub metas_applied: Counter,
    pub drain_failures: Counter,
    pub recv_failures: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            meta_uploads: Counter::new("Number of meta uploads sent"),
            meta_downloads: Counter::new("Number of meta downloads awaited"),
            events_received: Counter::new("Number of inbound events received"),
            events_deduped: Counter::new("Number of inbound events dropped as duplicates"),
            drains: Counter::new("Number of queue drain batches applied"),
            metas_applied: Counter::new("Number of metas applied to remote meta stores"),
            drain_failures: Counter::new("Number of drain batches that failed to apply"),
            recv_failures: Counter::new("Number of inbound messages that failed to handle"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "cask_sync"
    }
}
