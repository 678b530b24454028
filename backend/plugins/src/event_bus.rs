//! Event Bus
//!
//! The publish/subscribe contract plugins are wired to, plus an in-process
//! priority-ordered implementation.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// An event routed through the bus. The payload is opaque to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Opaque token identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub type HandlerOutcome = Result<Value>;
pub type EventHandler = Arc<dyn Fn(&Event) -> HandlerOutcome + Send + Sync>;

/// Shared router delivering events to priority-ordered handlers.
#[async_trait]
pub trait EventBus: Send + Sync {
    fn subscribe(&self, event_type: &str, handler: EventHandler, priority: i32) -> HandlerId;

    /// Revoke a subscription. Unknown ids are an error.
    fn unsubscribe(&self, id: HandlerId) -> Result<()>;

    fn publish_sync(&self, event: &Event) -> Vec<HandlerOutcome>;

    async fn publish_async(&self, event: Event) -> Vec<HandlerOutcome>;
}

struct Subscription {
    id: HandlerId,
    priority: i32,
    handler: EventHandler,
}

#[derive(Default)]
struct Routes {
    by_type: HashMap<String, Vec<Subscription>>,
    index: HashMap<HandlerId, String>,
}

/// In-process bus. Higher priority runs first; equal priorities keep
/// registration order.
#[derive(Default, Clone)]
pub struct PriorityEventBus {
    routes: Arc<RwLock<Routes>>,
}

impl PriorityEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        let routes = self.routes.read().unwrap_or_else(|p| p.into_inner());
        routes.by_type.get(event_type).map_or(0, Vec::len)
    }

    pub fn total_handlers(&self) -> usize {
        let routes = self.routes.read().unwrap_or_else(|p| p.into_inner());
        routes.index.len()
    }

    /// Snapshot the handlers for a type so they run without the lock held.
    fn handlers_for(&self, event_type: &str) -> Vec<EventHandler> {
        let routes = self.routes.read().unwrap_or_else(|p| p.into_inner());
        routes
            .by_type
            .get(event_type)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for PriorityEventBus {
    fn subscribe(&self, event_type: &str, handler: EventHandler, priority: i32) -> HandlerId {
        let id = HandlerId::new();
        let mut routes = self.routes.write().unwrap_or_else(|p| p.into_inner());
        let subs = routes.by_type.entry(event_type.to_string()).or_default();
        let pos = subs.partition_point(|s| s.priority >= priority);
        subs.insert(pos, Subscription { id, priority, handler });
        routes.index.insert(id, event_type.to_string());
        debug!(event_type, %id, priority, "Handler subscribed");
        id
    }

    fn unsubscribe(&self, id: HandlerId) -> Result<()> {
        let mut routes = self.routes.write().unwrap_or_else(|p| p.into_inner());
        let event_type = routes
            .index
            .remove(&id)
            .ok_or_else(|| anyhow!("unknown handler id {id}"))?;
        if let Some(subs) = routes.by_type.get_mut(&event_type) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                routes.by_type.remove(&event_type);
            }
        }
        debug!(event_type = %event_type, %id, "Handler unsubscribed");
        Ok(())
    }

    fn publish_sync(&self, event: &Event) -> Vec<HandlerOutcome> {
        let handlers = self.handlers_for(&event.event_type);
        info!(event_type = %event.event_type, handlers = handlers.len(), "Publishing event");
        handlers.iter().map(|h| h(event)).collect()
    }

    async fn publish_async(&self, event: Event) -> Vec<HandlerOutcome> {
        let handlers = self.handlers_for(&event.event_type);
        info!(
            event_type = %event.event_type,
            handlers = handlers.len(),
            "Publishing event (async)"
        );
        let mut results = Vec::with_capacity(handlers.len());
        for handler in handlers {
            results.push(handler(&event));
            tokio::task::yield_now().await;
        }
        results
    }
}
