//! Broadcast channel collaborator (§6.2).
//!
//! `broadcast(userId, event)` is one-way and best-effort: the core never
//! waits on a client to drain its channel, and a slow or absent client must
//! never be capable of applying back-pressure to handler execution. The
//! default implementation is a bounded `tokio::sync::broadcast` channel per
//! agent — when a subscriber falls behind, the channel drops the oldest
//! unread messages for it rather than blocking the sender (§9 redesign
//! flag "bounded channel with drop policy").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::events::BroadcastEvent;
use crate::ids::UserId;

/// One-way, best-effort event delivery to whatever is listening for a
/// given agent.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn broadcast(&self, user_id: UserId, event: BroadcastEvent);
}

/// In-process, topic-keyed broadcast hub. Topics are agent ids; payloads
/// are the stamped `{ type, payload, timestamp }` event shape.
#[derive(Clone)]
pub struct InProcessBroadcast {
    channels: Arc<RwLock<HashMap<UserId, broadcast::Sender<BroadcastEvent>>>>,
    capacity: usize,
}

impl InProcessBroadcast {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Subscribe to one agent's event stream, creating its channel if this
    /// is the first subscriber.
    pub async fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<BroadcastEvent> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Drop channels with no subscribers left (periodic housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for InProcessBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastChannel for InProcessBroadcast {
    async fn broadcast(&self, user_id: UserId, event: BroadcastEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&user_id) {
            // No active receivers, or a lagging one that just dropped
            // messages, are both fine: broadcast is fire-and-forget.
            if tx.send(event).is_err() {
                warn!(%user_id, "broadcast had no active subscribers");
            }
        }
    }
}
