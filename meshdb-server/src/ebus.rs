//! In-process event bus.
//!
//! Publish/subscribe keyed by event tag. `publish` runs every subscriber
//! synchronously on the publisher's thread; the subscription list is
//! snapshotted before dispatch so handlers may subscribe or unsubscribe
//! while an event is being delivered. Handlers that need to do real work
//! hand it off to the job scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::topology::Topology;

/// Events delivered over the bus. The set is closed.
#[derive(Debug, Clone)]
pub enum Event {
    /// The tracker published a new topology snapshot.
    TopologyChanged { topology: Arc<Topology> },
    /// A peer session reached the established state.
    PeerConnected { uuid: Uuid, local_id: u32 },
    /// A peer session closed.
    PeerDisconnected { uuid: Uuid },
    /// New entries were appended to the log of `origin`.
    LogUpdated { origin: Uuid },
}

/// Tag identifying the event variant, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    TopologyChanged,
    PeerConnected,
    PeerDisconnected,
    LogUpdated,
}

impl Event {
    pub fn tag(&self) -> EventTag {
        match self {
            Event::TopologyChanged { .. } => EventTag::TopologyChanged,
            Event::PeerConnected { .. } => EventTag::PeerConnected,
            Event::PeerDisconnected { .. } => EventTag::PeerDisconnected,
            Event::LogUpdated { .. } => EventTag::LogUpdated,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    tag: EventTag,
    id: u64,
}

#[derive(Default)]
pub struct EventBus {
    subs: RwLock<HashMap<EventTag, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, tag: EventTag, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.write().entry(tag).or_default().push((id, Arc::new(handler)));
        Subscription { tag, id }
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        if let Some(list) = self.subs.write().get_mut(&sub.tag) {
            list.retain(|(id, _)| *id != sub.id);
        }
    }

    /// Deliver an event to every subscriber of its tag, on this thread.
    pub fn publish(&self, event: &Event) {
        let handlers: Vec<Handler> = match self.subs.read().get(&event.tag()) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in handlers {
            handler(event);
        }
    }
}
