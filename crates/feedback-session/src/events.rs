//! Signal-only publish/subscribe bus for session events.
//!
//! The transport layer publishes [`EventKind::UNAUTHORIZED`] and the session
//! monitor publishes [`EventKind::EXPIRED`]; the owning session layer
//! subscribes to both. Delivery is synchronous, on the publisher's task, in
//! registration order.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Identifies a class of signal. Any string is a valid kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKind(Cow<'static, str>);

impl EventKind {
    /// A request was rejected because the credential was not accepted.
    pub const UNAUTHORIZED: EventKind = EventKind(Cow::Borrowed("unauthorized"));
    /// The session monitor reached terminal expiry.
    pub const EXPIRED: EventKind = EventKind(Cow::Borrowed("expired"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

/// In-process event bus. Share it behind an `Arc`.
#[derive(Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Keep the returned [`Subscription`] to
    /// remove it later; dropping the subscription does not unsubscribe.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Invoke every handler registered for `kind` at the time of the call.
    pub fn publish(&self, kind: &EventKind) {
        let snapshot: Vec<Handler> = match lock(&self.registry).handlers.get(kind) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => Vec::new(),
        };
        tracing::debug!(kind = %kind, handlers = snapshot.len(), "publishing event");
        for handler in snapshot {
            handler();
        }
    }

    pub fn handler_count(&self, kind: &EventKind) -> usize {
        lock(&self.registry)
            .handlers
            .get(kind)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Remove the handler. Calling this more than once, or after the bus is
    /// gone, is a no-op.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(list) = registry.handlers.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                registry.handlers.remove(&self.kind);
            }
        }
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|p| p.into_inner())
}
