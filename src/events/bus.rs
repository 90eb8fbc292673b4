use crate::error::AppError;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tracing::debug;

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Pub/sub capability the manager needs from whatever bridge carries events.
///
/// Handlers run on the emitter's thread and must not block.
pub trait EventTransport: Send + Sync {
    fn subscribe(&self, channel: &str, handler: EventHandler) -> Result<Subscription, AppError>;
    fn emit(&self, channel: &str, payload: Value) -> Result<(), AppError>;
}

pub trait EmitExt {
    fn emit_payload<T: Serialize>(&self, channel: &str, payload: &T) -> Result<(), AppError>;
}

impl<E: EventTransport + ?Sized> EmitExt for E {
    fn emit_payload<T: Serialize>(&self, channel: &str, payload: &T) -> Result<(), AppError> {
        let value = serde_json::to_value(payload)?;
        self.emit(channel, value)
    }
}

/// Handle returned by [`EventTransport::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            channel: channel.into(),
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[derive(Default)]
struct BusInner {
    handlers: StdMutex<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl BusInner {
    fn remove(&self, channel: &str, handler_id: u64) {
        let Ok(mut handlers) = self.handlers.lock() else {
            return;
        };
        if let Some(list) = handlers.get_mut(channel) {
            list.retain(|(id, _)| *id != handler_id);
            if list.is_empty() {
                handlers.remove(channel);
            }
        }
    }
}

/// In-process [`EventTransport`].
#[derive(Clone, Default)]
pub struct LocalEventBus {
    inner: Arc<BusInner>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tears the bus down; later subscribe/emit calls fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            handlers.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self, channel: &str) -> usize {
        self.inner
            .handlers
            .lock()
            .map(|h| h.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEventBus")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventTransport for LocalEventBus {
    fn subscribe(&self, channel: &str, handler: EventHandler) -> Result<Subscription, AppError> {
        if self.is_closed() {
            return Err(AppError::TransportUnavailable(format!(
                "bus closed, cannot listen on '{}'",
                channel
            )));
        }
        let handler_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .map_err(|e| AppError::TransportUnavailable(format!("Handler lock poisoned: {}", e)))?
            .entry(channel.to_string())
            .or_default()
            .push((handler_id, handler));
        debug!(channel, handler_id, "Listener attached");

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let channel_owned = channel.to_string();
        Ok(Subscription::new(channel, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(&channel_owned, handler_id);
                debug!(channel = %channel_owned, handler_id, "Listener detached");
            }
        }))
    }

    fn emit(&self, channel: &str, payload: Value) -> Result<(), AppError> {
        if self.is_closed() {
            return Err(AppError::TransportUnavailable(format!(
                "bus closed, cannot emit '{}'",
                channel
            )));
        }
        // Call handlers outside the lock so they may (un)subscribe.
        let handlers: Vec<EventHandler> = {
            let guard = self
                .inner
                .handlers
                .lock()
                .map_err(|e| AppError::TransportUnavailable(format!("Handler lock poisoned: {}", e)))?;
            guard
                .get(channel)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        if handlers.is_empty() {
            debug!(channel, "Event emitted with no listeners");
        }
        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (EventHandler, Arc<StdMutex<Vec<Value>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |v| sink.lock().unwrap().push(v));
        (handler, seen)
    }

    #[test]
    fn emit_reaches_subscribers_of_the_channel_only() {
        let bus = LocalEventBus::new();
        let (handler, seen) = recorder();
        let _sub = bus.subscribe("operation-output", handler).unwrap();

        bus.emit("operation-output", json!({"n": 1})).unwrap();
        bus.emit("operation-finished", json!({"n": 2})).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 1})]);
    }

    #[test]
    fn dropping_the_subscription_detaches() {
        let bus = LocalEventBus::new();
        let (handler, seen) = recorder();
        let sub = bus.subscribe("restore-panel", handler).unwrap();
        assert_eq!(bus.handler_count("restore-panel"), 1);

        drop(sub);
        assert_eq!(bus.handler_count("restore-panel"), 0);
        bus.emit("restore-panel", json!({})).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn explicit_unsubscribe_detaches() {
        let bus = LocalEventBus::new();
        let (handler, _) = recorder();
        let sub = bus.subscribe("cancel-operation", handler).unwrap();
        assert_eq!(sub.channel(), "cancel-operation");
        sub.unsubscribe();
        assert_eq!(bus.handler_count("cancel-operation"), 0);
    }

    #[test]
    fn closed_bus_refuses_everything() {
        let bus = LocalEventBus::new();
        bus.close();
        let (handler, _) = recorder();
        assert!(matches!(
            bus.subscribe("operation-output", handler),
            Err(AppError::TransportUnavailable(_))
        ));
        assert!(bus.emit("operation-output", json!({})).is_err());
    }

    #[test]
    fn emit_payload_serializes() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Ping {
            operation_id: &'static str,
        }
        let bus = LocalEventBus::new();
        let (handler, seen) = recorder();
        let _sub = bus.subscribe("ping", handler).unwrap();
        bus.emit_payload("ping", &Ping { operation_id: "run-1" }).unwrap();
        assert_eq!(seen.lock().unwrap()[0], json!({"operationId": "run-1"}));
    }
}
