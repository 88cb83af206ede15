//! Name-keyed table of action handlers.
//!
//! Built once at startup and passed by `Arc` into the runner and the
//! dispatcher. Keys are trimmed and lowercased; the last registration for a
//! key wins.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::Action;

#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn Action>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its `name()`, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn Action>) {
        let key = normalize(handler.name());
        if self.handlers.insert(key.clone(), handler).is_some() {
            tracing::debug!(action = %key, "action handler replaced");
        }
    }

    /// Builder-style `register`.
    pub fn with(mut self, handler: impl Action + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.handlers.get(&normalize(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&normalize(name))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
