//! Broadcast channel boundary.
//!
//! A [`SyncChannel`] is the transport seam of the sync layer: a
//! WebSocket-like room where every text message sent by anyone reaches every
//! subscriber. Real transports live outside this crate; [`MemHub`] is the
//! in-process loopback implementation used by tests and local setups.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

/// Capacity of each subscriber's inbound buffer.
const SUBSCRIBER_CAP: usize = 64;

/// A text broadcast channel.
#[async_trait]
pub trait SyncChannel: Send + Sync + Debug + 'static {
    /// Resolves once the channel is connected.
    async fn ready(&self) -> Result<()>;

    /// Broadcasts one text message to every subscriber of the room, the
    /// sender's own subscribers included.
    async fn send(&self, msg: String) -> Result<()>;

    /// Subscribes to all future messages on the room.
    fn subscribe(&self) -> mpsc::Receiver<String>;
}

/// In-memory loopback broker connecting any number of [`MemChannel`]s.
///
/// Cheaply cloneable, clones share the same room.
#[derive(Debug, Clone, Default)]
pub struct MemHub {
    subscribers: Arc<RwLock<Vec<mpsc::Sender<String>>>>,
}

impl MemHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a channel endpoint attached to this hub.
    pub fn endpoint(&self) -> MemChannel {
        MemChannel { hub: self.clone() }
    }

    /// Number of live subscribers.
    pub fn subscribers(&self) -> usize {
        self.subscribers.read().len()
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAP);
        self.subscribers.write().push(tx);
        rx
    }

    /// Delivers `msg` to every subscriber. A subscriber whose buffer is full
    /// has fallen behind and is dropped from the room.
    fn broadcast(&self, msg: &str) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sender| match sender.try_send(msg.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping lagged subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// One endpoint of a [`MemHub`].
#[derive(Debug, Clone)]
pub struct MemChannel {
    hub: MemHub,
}

#[async_trait]
impl SyncChannel for MemChannel {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, msg: String) -> Result<()> {
        self.hub.broadcast(&msg);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_includes_sender() {
        let hub = MemHub::new();
        let alice = hub.endpoint();
        let bob = hub.endpoint();

        let mut alice_rx = alice.subscribe();
        let mut bob_rx = bob.subscribe();
        assert_eq!(hub.subscribers(), 2);

        alice.ready().await.unwrap();
        alice.send("hello room".to_string()).await.unwrap();

        assert_eq!(alice_rx.recv().await.unwrap(), "hello room");
        assert_eq!(bob_rx.recv().await.unwrap(), "hello room");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_is_dropped() {
        let hub = MemHub::new();
        let sender = hub.endpoint();
        let mut stale = sender.subscribe();
        assert_eq!(hub.subscribers(), 1);

        for i in 0..SUBSCRIBER_CAP + 1 {
            sender.send(format!("msg {i}")).await.unwrap();
        }

        // the overflowing message evicted the subscriber
        assert_eq!(hub.subscribers(), 0);
        // but the buffered backlog is still readable
        assert_eq!(stale.recv().await.unwrap(), "msg 0");
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let hub = MemHub::new();
        let sender = hub.endpoint();
        let rx = sender.subscribe();
        drop(rx);

        sender.send("into the void".to_string()).await.unwrap();
        assert_eq!(hub.subscribers(), 0);
    }
}
