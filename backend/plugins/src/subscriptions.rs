//! Per-plugin record of event subscriptions, so unload can revoke them all.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::event_bus::{EventBus, EventHandler, HandlerId};

/// A handler one plugin instance registered with the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRegistration {
    pub id: HandlerId,
    pub event_type: String,
    pub priority: i32,
}

pub struct EventSubscriptionRegistry {
    plugin: String,
    bus: Arc<dyn EventBus>,
    registrations: Mutex<Vec<HandlerRegistration>>,
}

impl EventSubscriptionRegistry {
    pub fn new(plugin: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            plugin: plugin.into(),
            bus,
            registrations: Mutex::new(Vec::new()),
        }
    }

    fn registrations(&self) -> MutexGuard<'_, Vec<HandlerRegistration>> {
        self.registrations.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn register(&self, event_type: &str, handler: EventHandler, priority: i32) -> HandlerId {
        let id = self.bus.subscribe(event_type, handler, priority);
        self.registrations().push(HandlerRegistration {
            id,
            event_type: event_type.to_string(),
            priority,
        });
        debug!(plugin = %self.plugin, event_type, %id, "Registered handler");
        id
    }

    /// Revoke one handler. Returns false, doing nothing, for ids this plugin
    /// never registered (or already revoked).
    pub fn unregister(&self, id: HandlerId) -> bool {
        let removed = {
            let mut regs = self.registrations();
            match regs.iter().position(|r| r.id == id) {
                Some(pos) => {
                    regs.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            if let Err(e) = self.bus.unsubscribe(id) {
                warn!(plugin = %self.plugin, %id, error = %e, "Bus rejected unsubscribe");
            }
        }
        removed
    }

    /// Revoke every known handler. Failures are logged, never returned.
    pub fn unregister_all(&self) {
        let drained: Vec<HandlerRegistration> = self.registrations().drain(..).collect();
        for reg in &drained {
            if let Err(e) = self.bus.unsubscribe(reg.id) {
                warn!(
                    plugin = %self.plugin,
                    id = %reg.id,
                    event_type = %reg.event_type,
                    error = %e,
                    "Failed to unsubscribe handler"
                );
            }
        }
        if !drained.is_empty() {
            debug!(plugin = %self.plugin, count = drained.len(), "Revoked all handlers");
        }
    }

    pub fn active_count(&self) -> usize {
        self.registrations().len()
    }

    /// Ids of the handlers still subscribed, in registration order.
    pub fn ids(&self) -> Vec<HandlerId> {
        self.registrations().iter().map(|r| r.id).collect()
    }

    pub fn registrations_snapshot(&self) -> Vec<HandlerRegistration> {
        self.registrations().clone()
    }
}
