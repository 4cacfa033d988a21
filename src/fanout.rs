//! # Live Fan-out
//! Best-effort broadcast of committed changes and possibly-changed hints to every connected
//! subscriber. A slow or vanished subscriber never affects the others or the scheduler.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::Commit;
use crate::upstream::ItemId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    /// Forwarded verbatim from the push feed.
    PossiblyChanged { item_ids: Vec<ItemId> },
    Committed {
        item_id: ItemId,
        new_event_count: usize,
    },
}

impl LiveMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            LiveMessage::PossiblyChanged { .. } => "possibly_changed",
            LiveMessage::Committed { .. } => "committed",
        }
    }
}

impl From<Commit> for LiveMessage {
    fn from(c: Commit) -> Self {
        LiveMessage::Committed {
            item_id: c.item_id,
            new_event_count: c.new_event_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveFanout {
    tx: broadcast::Sender<LiveMessage>,
}

impl LiveFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveMessage> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers the message was queued for. Zero is not an error.
    pub fn publish(&self, msg: LiveMessage) -> usize {
        match self.tx.send(msg) {
            Ok(n) => n,
            Err(broadcast::error::SendError(msg)) => {
                tracing::trace!(target: "fanout", kind = msg.event_name(), "no live subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveFanout {
    fn default() -> Self {
        Self::new(1024)
    }
}
