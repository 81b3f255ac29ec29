//! Invalidation broadcast between the reconciler and any cache

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Ids that were proven absent remotely and must be purged locally
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationEvent {
    pub removed_ids: Vec<String>,
}

/// Cloneable handle to the invalidation channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event, returning how many receivers saw it
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                log::debug!("Invalidation event dropped, no receivers");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
