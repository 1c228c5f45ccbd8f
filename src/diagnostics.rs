//! The `verbose` diagnostic stream.
//!
//! Every layer (server factory, plugin stack, plugins, listener, contexts)
//! reports `(key, value)` pairs on one channel so a single subscription sees
//! the whole system. The sink is an explicit value handed down at
//! construction time; there is no process-global emitter.
//!
//! ```rust
//! use serde_json::json;
//! use wharf::Verbose;
//!
//! let verbose = Verbose::new();
//! let mut rx = verbose.subscribe();
//! verbose.namespaced("stack").emit("stack.loaded", json!(["cors"]));
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(event.source.as_deref(), Some("stack"));
//! assert_eq!(event.key, "stack.loaded");
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// One diagnostic event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    /// Dotted namespace of the emitting sink, if any (`"stack.cors"`).
    pub source: Option<String>,
    pub key: String,
    pub value: Value,
}

/// Handle onto the diagnostic channel. Cloning is cheap; clones share the
/// channel.
#[derive(Clone, Debug)]
pub struct Verbose {
    tx: broadcast::Sender<Event>,
    source: Option<Arc<str>>,
}

impl Verbose {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Subscribers lagging more than `capacity` events behind lose the
    /// oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, source: None }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Child sink on the same channel whose events carry `name` appended to
    /// this sink's namespace.
    pub fn namespaced(&self, name: &str) -> Self {
        let source = match &self.source {
            Some(parent) => format!("{parent}.{name}"),
            None => name.to_owned(),
        };
        Self { tx: self.tx.clone(), source: Some(source.into()) }
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn emit(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        tracing::debug!(
            target: "wharf::verbose",
            source = self.source.as_deref().unwrap_or("-"),
            key = %key,
            value = %value,
        );
        // No subscribers is not an error.
        let _ = self.tx.send(Event {
            source: self.source.as_ref().map(|s| s.to_string()),
            key,
            value,
        });
    }
}

impl Default for Verbose {
    fn default() -> Self { Self::new() }
}
