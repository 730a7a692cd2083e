use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Fan-out registry for connected observers.
///
/// Each observer owns an unbounded queue; publishing clones the message into
/// every live queue and never waits on a slow consumer; a blocked observer
/// delays neither ingestion nor the other observers. Queues whose receiver
/// has gone away are pruned at the next publish.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    observers: Arc<Mutex<Vec<Observer>>>,
}

struct Observer {
    id: Uuid,
    queue: flume::Sender<ServerMessage>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer and return its identity and queue. The queue
    /// receives every message published from this point forward.
    pub fn subscribe(&self) -> (Uuid, flume::Receiver<ServerMessage>) {
        let (tx, rx) = flume::unbounded();
        let id = Uuid::new_v4();
        let mut observers = self.observers.lock().expect("hub lock poisoned");
        observers.push(Observer { id, queue: tx });
        debug!(observer = %id, total = observers.len(), "observer subscribed");
        (id, rx)
    }

    /// Remove one observer. Idempotent; unknown ids are a no-op.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut observers = self.observers.lock().expect("hub lock poisoned");
        observers.retain(|observer| observer.id != id);
        debug!(observer = %id, total = observers.len(), "observer unsubscribed");
    }

    /// Deliver a message to every connected observer. Observers whose
    /// receiving end has been dropped are pruned here.
    pub fn publish(&self, message: ServerMessage) {
        let mut observers = self.observers.lock().expect("hub lock poisoned");
        observers.retain(|observer| observer.queue.send(message.clone()).is_ok());
    }

    /// Number of currently connected observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().expect("hub lock poisoned").len()
    }
}
