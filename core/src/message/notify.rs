//! Notification dispatcher — topic to handler registry
//!
//! Unsolicited inbound frames are routed synchronously to whichever handler
//! is registered for their topic, in arrival order. A handler registers per
//! topic (registering again replaces, unregistering is idempotent) and must
//! hand long-running work off rather than block the dispatch path. A
//! panicking handler is isolated per call so it cannot stop later
//! notifications.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handler invoked with the raw frame for its topic.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Registry mapping topic identifiers to handlers. At most one handler per
/// topic.
#[derive(Default)]
pub struct NotificationDispatcher {
    handlers: RwLock<HashMap<String, NotificationHandler>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `topic`, replacing any existing one.
    pub fn register(&self, topic: impl Into<String>, handler: NotificationHandler) {
        let topic = topic.into();
        let mut handlers = self.handlers.write();
        if handlers.insert(topic.clone(), handler).is_some() {
            debug!("Replaced notification handler for topic {}", topic);
        }
    }

    /// Convenience wrapper over [`register`](Self::register) for closures.
    pub fn register_fn<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.register(topic, Arc::new(handler));
    }

    /// Remove the handler for `topic`. Idempotent.
    pub fn unregister(&self, topic: &str) {
        self.handlers.write().remove(topic);
    }

    /// Invoke the current handler for `topic`. Returns whether a handler
    /// was present. The handler runs outside the registry lock.
    pub fn dispatch(&self, topic: &str, data: &[u8]) -> bool {
        let handler = self.handlers.read().get(topic).cloned();
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                    warn!("Notification handler for topic {} panicked", topic);
                }
                true
            }
            None => {
                debug!(
                    "Dropped notification on unhandled topic {} ({} bytes)",
                    topic,
                    data.len()
                );
                false
            }
        }
    }
}
