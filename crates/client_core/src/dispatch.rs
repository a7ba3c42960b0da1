use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use shared::protocol::Envelope;
use tracing::{trace, warn};

/// Receives inbound application envelopes of the event types it is registered for.
pub trait EventHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

pub type SharedHandler = Arc<dyn EventHandler>;

struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        (self.0)(envelope)
    }
}

/// Wraps a closure as a handler. Keep the returned `Arc` to unregister it later.
pub fn handler_fn<F>(f: F) -> SharedHandler
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFault {
    pub event_type: String,
    pub message: String,
}

/// Registry from event type to the set of handlers interested in it.
///
/// Handler identity is the `Arc` allocation: registering the same `Arc` twice
/// keeps one entry. An event type disappears from the registry when its last
/// handler is removed.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<SharedHandler>>>,
}

fn same_handler(a: &SharedHandler, b: &SharedHandler) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the handler was already registered for `event_type`.
    pub fn on(&self, event_type: impl Into<String>, handler: SharedHandler) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let set = handlers.entry(event_type.into()).or_default();
        if set.iter().any(|existing| same_handler(existing, &handler)) {
            return false;
        }
        set.push(handler);
        true
    }

    /// Returns `false` when the handler was not registered for `event_type`.
    pub fn off(&self, event_type: &str, handler: &SharedHandler) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = handlers.get_mut(event_type) else {
            return false;
        };
        let before = set.len();
        set.retain(|existing| !same_handler(existing, handler));
        let removed = set.len() != before;
        if set.is_empty() {
            handlers.remove(event_type);
        }
        removed
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Invokes every handler registered for `envelope.kind`.
    ///
    /// Each invocation is isolated: an error or panic in one handler is
    /// collected into the returned faults and the remaining handlers still run.
    pub fn dispatch(&self, envelope: &Envelope) -> Vec<HandlerFault> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.kind)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            trace!(event_type = %envelope.kind, "dispatch: no handlers registered");
            return Vec::new();
        }

        let mut faults = Vec::new();
        for handler in handlers {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(envelope)))
            {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(event_type = %envelope.kind, error = %message, "dispatch: handler failed");
            faults.push(HandlerFault {
                event_type: envelope.kind.clone(),
                message,
            });
        }
        faults
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
