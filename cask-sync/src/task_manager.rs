//! Inbound event queue.
//!
//! The [`TaskManager`] sits between the receive loop and the loader: every
//! inbound [`EventBlock`] is queued, causally deduplicated against the events
//! already handled, and applied in arrival-order batches through the loader's
//! remote meta store. At most one drain task runs at any time, so batches are
//! never applied concurrently.
//!
//! Dedup is causal: an event's parents are retired the moment the event
//! arrives, whether or not the parents themselves were ever seen. Once a cid
//! is marked handled it stays handled.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use cid::Cid;
use iroh_metrics::{inc, inc_by};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use cask_store::Loader;

use crate::event::EventBlock;
use crate::metrics::Metrics;

/// One queued inbound event and the loader it arrived for.
#[derive(Debug)]
struct QueueEntry {
    cid: Cid,
    event: EventBlock,
    origin: Arc<dyn Loader>,
}

#[derive(Debug, Default)]
struct State {
    handled: HashSet<Cid>,
    queue: VecDeque<QueueEntry>,
    draining: bool,
}

/// Causal deduplication and serialized application of inbound metas.
///
/// Cheaply cloneable, clones share state.
#[derive(Debug, Clone, Default)]
pub struct TaskManager {
    state: Arc<Mutex<State>>,
}

impl TaskManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an inbound event and makes sure a drain is running.
    ///
    /// The event's parents are marked handled immediately: their arrival is
    /// subsumed by this event, so a queued parent will never be applied and
    /// a parent arriving later is dropped on arrival. The call only enqueues
    /// and returns, application happens on the drain task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle_event(&self, event: EventBlock, origin: Arc<dyn Loader>) {
        let start_drain = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for parent in event.parents() {
                state.handled.insert(*parent);
            }
            let cid = *event.cid();
            trace!(%cid, parents = event.parents().len(), "queueing event");
            state.queue.push_back(QueueEntry { cid, event, origin });
            inc!(Metrics, events_received);

            let before = state.queue.len();
            let handled = &state.handled;
            state.queue.retain(|entry| !handled.contains(&entry.cid));
            inc_by!(Metrics, events_deduped, (before - state.queue.len()) as u64);

            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if start_drain {
            let this = self.clone();
            tokio::spawn(async move {
                this.process_queue().await;
            });
        }
    }

    /// Drain task: applies unhandled queue entries batch by batch until the
    /// queue is empty, then clears the `draining` flag and exits.
    ///
    /// Emptiness is checked and the flag cleared under the same lock
    /// acquisition, so an event queued concurrently either lands in front of
    /// a running drain or observes the cleared flag and starts a new one.
    async fn process_queue(&self) {
        loop {
            let (cids, metas, origin) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let batch: Vec<&QueueEntry> = state
                    .queue
                    .iter()
                    .filter(|entry| !state.handled.contains(&entry.cid))
                    .collect();
                if batch.is_empty() {
                    state.draining = false;
                    return;
                }
                let cids: Vec<Cid> = batch.iter().map(|entry| entry.cid).collect();
                let metas: Vec<Bytes> = batch
                    .iter()
                    .map(|entry| entry.event.db_meta().clone())
                    .collect();
                let origin = batch[0].origin.clone();
                (cids, metas, origin)
            };

            inc!(Metrics, drains);
            debug!(batch = cids.len(), "applying meta batch");
            let start = Instant::now();
            let res = match origin.remote_meta_store() {
                Some(remote) => remote.handle_byte_heads(metas).await,
                // no ingestion path attached: the batch is still retired
                None => Ok(()),
            };

            match res {
                Ok(()) => {
                    let mut guard = self.state.lock();
                    let state = &mut *guard;
                    for cid in &cids {
                        state.handled.insert(*cid);
                    }
                    let handled = &state.handled;
                    state.queue.retain(|entry| !handled.contains(&entry.cid));
                    inc_by!(Metrics, metas_applied, cids.len() as u64);
                    debug!(
                        batch = cids.len(),
                        elapsed = ?start.elapsed(),
                        "meta batch applied"
                    );
                }
                Err(err) => {
                    // leave the batch queued, a later event restarts the drain
                    inc!(Metrics, drain_failures);
                    warn!("failed to apply meta batch: {err:#}");
                    self.state.lock().draining = false;
                    return;
                }
            }
        }
    }

    /// Number of cids marked handled so far. Grows without bound.
    pub fn handled_len(&self) -> usize {
        self.state.lock().handled.len()
    }

    /// Number of queued entries, handled or not.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }
}
