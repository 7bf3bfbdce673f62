use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

/// Fan-out observability events (status strings) to any subscriber.
///
/// Sends never block: with no subscribers the event is dropped, and slow
/// subscribers lag rather than back-pressure the dispatcher.
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn send(&self, payload: String) {
        let _ = self.tx.send(payload);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
