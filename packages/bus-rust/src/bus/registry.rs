use std::collections::HashMap;
use std::sync::Arc;

use conveyor_core::MessageKind;

use crate::error::DispatchError;
use crate::handler::{DynHandler, HandlerEntry};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Subscription registry: message kind -> handlers in registration order.
///
/// Written only while a bus is being configured. `run` moves the registry
/// into an `Arc` shared by every worker, after which it is read without
/// locking.
#[derive(Debug, Default)]
pub struct Registry {
    routes: HashMap<MessageKind, Vec<HandlerEntry>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the handlers of `kind`. Used by the event bus.
    pub fn append(&mut self, kind: MessageKind, handler: Arc<dyn DynHandler>) {
        tracing::debug!(%kind, handler = handler.handler_name(), "handler subscribed");
        self.routes
            .entry(kind.clone())
            .or_default()
            .push(HandlerEntry::new(kind, handler));
    }

    /// Registers the only handler of `kind`. Used by the command bus.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if `kind` already has a
    /// handler.
    pub fn insert_unique(
        &mut self,
        kind: MessageKind,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), DispatchError> {
        if let Some(existing) = self.routes.get(&kind).and_then(|entries| entries.first()) {
            return Err(DispatchError::Configuration {
                reason: format!(
                    "handler {} already registered, refusing {}",
                    existing.name(),
                    handler.handler_name()
                ),
                kind,
            });
        }
        self.append(kind, handler);
        Ok(())
    }

    /// Handlers of `kind` in registration order; empty when none.
    #[must_use]
    pub fn handlers_for(&self, kind: &str) -> &[HandlerEntry] {
        self.routes.get(kind).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers_for(kind).len()
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<MessageKind> {
        let mut kinds: Vec<_> = self.routes.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
