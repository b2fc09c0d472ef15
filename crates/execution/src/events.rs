//! In-process event bus.

use devflow_core::{Event, EventKind};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity for orchestration events.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Fire-and-forget broadcast of [`Event`]s to any number of listeners.
///
/// Publishing never blocks and never fails; with no subscribers the event is
/// simply dropped. Slow subscribers may lag and miss events, so listeners
/// treat every event as a hint and re-read state.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Stamp and broadcast an event.
    pub fn publish(&self, kind: EventKind) -> Event {
        let event = Event::new(kind);
        debug!(event = event.kind.name(), id = %event.id, "publish");
        let _ = self.sender.send(event.clone());
        event
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
