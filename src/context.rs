use std::sync::Arc;

use dashmap::DashMap;

use crate::value::Payload;

/// One key-value scope of context data.
#[derive(Debug, Default)]
pub struct ContextScope {
    store: DashMap<String, Payload>,
}

impl ContextScope {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { store: DashMap::new() })
    }

    pub fn get(&self, key: &str) -> Option<Payload> {
        self.store.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Payload) {
        self.store.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Payload> {
        self.store.remove(key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

/// The three context scopes visible from a node: its own store, the owning
/// flow's store, and the runtime-global store. Node scope dies with the node
/// instance; flow scope with the flow; global scope with the runtime.
#[derive(Debug, Clone)]
pub struct Context {
    node: Arc<ContextScope>,
    flow: Arc<ContextScope>,
    global: Arc<ContextScope>,
}

impl Context {
    pub fn new(flow: Arc<ContextScope>, global: Arc<ContextScope>) -> Self {
        Self {
            node: ContextScope::new(),
            flow,
            global,
        }
    }

    pub fn node(&self) -> &ContextScope {
        &self.node
    }

    pub fn flow(&self) -> &ContextScope {
        &self.flow
    }

    pub fn global(&self) -> &ContextScope {
        &self.global
    }
}
