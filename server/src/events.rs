//! Fan-out of world change notifications.
//!
//! Listeners register per [`EventKind`] with [`EventBroadcaster::on`]; a
//! transport layer can instead take a channel receiver via
//! [`EventBroadcaster::subscribe`] and forward every event.

use log::debug;
use shared::events::{EventKind, PointPayload, ServerEvent};
use shared::Point;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 256;

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct EventBroadcaster {
    sender: broadcast::Sender<ServerEvent>,
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, EventHandler)>>>,
    next_listener_id: AtomicU64,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub async fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .await
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a listener. Returns false if it was not registered for `kind`.
    pub async fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        match listeners.get_mut(&kind) {
            Some(handlers) => {
                let before = handlers.len();
                handlers.retain(|(listener, _)| *listener != id);
                handlers.len() != before
            }
            None => false,
        }
    }

    pub async fn broadcast(&self, event: ServerEvent) {
        let handlers: Vec<EventHandler> = {
            let listeners = self.listeners.read().await;
            listeners
                .get(&event.kind())
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            handler(&event);
        }

        if self.sender.send(event).is_err() {
            debug!("No transport subscribers for event");
        }
    }

    pub async fn emit_created(&self, point: &Point) {
        self.broadcast(ServerEvent::BasePointChanged {
            point: PointPayload::from(point),
        })
        .await;
    }

    pub async fn emit_updated(&self, point: &Point) {
        self.broadcast(ServerEvent::BasePointChanged {
            point: PointPayload::from(point),
        })
        .await;
    }

    pub async fn emit_deleted(&self, point: &Point, count: usize) {
        self.broadcast(ServerEvent::BasePointDeleted {
            point: PointPayload::from(point),
            count,
        })
        .await;
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
