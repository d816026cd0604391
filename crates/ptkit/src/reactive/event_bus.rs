//! EventBus<E> — a name-keyed listener registry and dispatch primitive.
//!
//! Listener identity is the name: registering a name that is already present
//! replaces the previous callback in place (keeping its dispatch position) and
//! logs a warning.
//!
//! A bus is owned by exactly one mirror task, so it carries no lock of its
//! own: registration, replay and dispatch are serialized by the task. A
//! listener that panics is caught and logged; delivery continues with the
//! next listener and the panic never reaches the mutator.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Closure type for bus listeners.
pub type ListenerFn<E> = dyn Fn(&E) + Send + Sync;

pub struct EventBus<E> {
    label: Arc<str>,
    listeners: Vec<(String, Box<ListenerFn<E>>)>,
}

impl<E> EventBus<E> {
    /// Create an empty bus. `label` names the owner in log output.
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
            listeners: Vec::new(),
        }
    }

    /// Store `callback` under `name` without any replay.
    pub fn register(&mut self, name: impl Into<String>, callback: Box<ListenerFn<E>>) {
        self.register_with(name, callback, std::iter::empty());
    }

    /// Replay `bootstrap` to `callback`, then store it under `name`.
    ///
    /// The replay happens before the listener joins the registry, so its first
    /// observations are exactly the bootstrap events, followed by whatever is
    /// dispatched afterwards.
    pub fn register_with(
        &mut self,
        name: impl Into<String>,
        callback: Box<ListenerFn<E>>,
        bootstrap: impl IntoIterator<Item = E>,
    ) {
        let name = name.into();
        tracing::debug!(bus = %self.label, listener = %name, "new listener");

        for event in bootstrap {
            self.invoke(&name, callback.as_ref(), &event);
        }

        match self.listeners.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => {
                tracing::warn!(bus = %self.label, listener = %name, "listener name re-registered, replacing");
                slot.1 = callback;
            }
            None => self.listeners.push((name, callback)),
        }
    }

    /// Remove the listener registered under `name`. No-op if absent.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(n, _)| n != name);
        let removed = self.listeners.len() != before;
        if removed {
            tracing::debug!(bus = %self.label, listener = %name, "removed listener");
        }
        removed
    }

    /// Deliver `event` to every listener in registration order.
    pub fn dispatch(&self, event: &E) {
        for (name, callback) in &self.listeners {
            self.invoke(name, callback.as_ref(), event);
        }
    }

    /// Drop every listener.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.listeners.iter().any(|(n, _)| n == name)
    }

    fn invoke(&self, name: &str, callback: &ListenerFn<E>, event: &E) {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            tracing::warn!(bus = %self.label, listener = %name, "listener panicked");
        }
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("label", &self.label)
            .field(
                "listeners",
                &self.listeners.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}
