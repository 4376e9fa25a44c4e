//! Listener registration and delivered-event fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use wrp_entity::{EntityId, ListenerId};
use wrp_events::EventType;

use crate::registry::Delivery;

/// Receives delivered events matching a listener's filters.
///
/// Invoked once per delivered (event, recipient) pair.
pub trait EventListener: Send + Sync {
    fn on_event(&self, delivery: &Delivery);
}

/// Optional match criteria for a listener; an absent field matches all.
#[derive(Debug, Clone, Default)]
pub struct ListenerFilter {
    /// Only events of this type.
    pub event_type: Option<EventType>,

    /// Only events from this source.
    pub source: Option<EntityId>,

    /// Only deliveries to this recipient. This is also the only way a
    /// listener sees blind-recipient deliveries: filtering on one's own
    /// entity matches a delivery bcc'd to it.
    pub destination: Option<EntityId>,
}

impl ListenerFilter {
    fn matches(&self, delivery: &Delivery) -> bool {
        if let Some(ty) = &self.event_type {
            if ty != &delivery.event_type {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if source != delivery.visible.source() {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            if destination != &delivery.recipient {
                return false;
            }
        }
        true
    }
}

struct Registration {
    filter: ListenerFilter,
    listener: Arc<dyn EventListener>,
}

/// Registry of event listeners with add/remove and delivered fan-out.
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<HashMap<ListenerId, Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and returns its removal handle.
    pub fn add(&self, listener: Arc<dyn EventListener>, filter: ListenerFilter) -> ListenerId {
        let id = ListenerId::new();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Registration { filter, listener });
        debug!(listener_id = %id, "Listener registered");
        id
    }

    /// Removes a listener. Returns false if the id was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let removed = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            debug!(listener_id = %id, "Listener removed");
        }
        removed
    }

    /// Fans a delivered event out to matching listeners.
    pub(crate) fn notify_delivered(&self, delivery: &Delivery) {
        let matching: Vec<Arc<dyn EventListener>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .values()
                .filter(|reg| reg.filter.matches(delivery))
                .map(|reg| reg.listener.clone())
                .collect()
        };
        for listener in matching {
            listener.on_event(delivery);
        }
    }
}
