// src/services/events.rs
//! Typed lifecycle signals for the presentation layer.
//!
//! Consumers register a handler per [`EventKind`] and get back a [`Listener`]
//! that unregisters the handler when disposed or dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing;

use crate::models::notification::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Error,
    ReconnectFailed,
    NotificationReceived,
    OrderUpdate,
    PaymentUpdate,
    DeliveryUpdate,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected { user_id: String },
    Error { message: String, attempt: u32 },
    ReconnectFailed { attempts: u32 },
    NotificationReceived(Notification),
    OrderUpdate(Notification),
    PaymentUpdate(Notification),
    DeliveryUpdate(Notification),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connected { .. } => EventKind::Connected,
            ChannelEvent::Error { .. } => EventKind::Error,
            ChannelEvent::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            ChannelEvent::NotificationReceived(_) => EventKind::NotificationReceived,
            ChannelEvent::OrderUpdate(_) => EventKind::OrderUpdate,
            ChannelEvent::PaymentUpdate(_) => EventKind::PaymentUpdate,
            ChannelEvent::DeliveryUpdate(_) => EventKind::DeliveryUpdate,
        }
    }

    pub fn notification(&self) -> Option<&Notification> {
        match self {
            ChannelEvent::NotificationReceived(n)
            | ChannelEvent::OrderUpdate(n)
            | ChannelEvent::PaymentUpdate(n)
            | ChannelEvent::DeliveryUpdate(n) => Some(n),
            _ => None,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<EventKind, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, kind: EventKind, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(handler_id, _)| *handler_id != id);
                before != list.len()
            }
            None => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Listener
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        Listener {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Deliver `event` to every handler registered for its kind and return how
    /// many ran. Handlers are invoked outside the registry lock.
    pub fn publish(&self, event: ChannelEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        tracing::trace!("Publishing {:?} to {} handler(s)", kind, handlers.len());
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Disposer for a registered handler.
#[must_use = "dropping a Listener unregisters its handler"]
pub struct Listener {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Listener {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn dispose(self) {
        // Drop does the work
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.kind, self.id);
        }
    }
}
