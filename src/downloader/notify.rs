//! Event fan-out to UI subscribers.

use tokio::sync::broadcast;
use tracing::trace;

use super::models::TransferEvent;

/// Sink for transfer events, best effort
pub trait Notifier: Send + Sync {
    fn emit(&self, event: TransferEvent);
}

/// Publishes events on a tokio broadcast channel. Slow subscribers lag and
/// lose the oldest events instead of blocking the engine.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<TransferEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: TransferEvent) {
        trace!(event = event.name(), transfer = event.transfer_id(), "Emitting event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}
