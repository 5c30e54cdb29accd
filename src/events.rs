use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event ids emitted on the runtime bus.
pub mod topic {
    pub const FLOWS_STARTING: &str = "flows:starting";
    pub const FLOWS_STARTED: &str = "flows:started";
    pub const FLOWS_STOPPING: &str = "flows:stopping";
    pub const FLOWS_STOPPED: &str = "flows:stopped";
    pub const RUNTIME_STATE: &str = "runtime-state";
    pub const RUNTIME_DEPLOY: &str = "runtime-deploy";
    pub const RESTART_REQUIRED: &str = "restart-required";
    pub const TYPE_REGISTERED: &str = "type-registered";
    pub const NODE_STATUS: &str = "node-status";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: String,
    pub payload: Value,
    pub retained: bool,
    pub at: DateTime<Utc>,
}

/// Fan-out bus for UI/observability collaborators.
///
/// Retained events keep the latest payload per id so a subscriber arriving
/// after the fact still sees the current runtime state or warning.
pub struct RuntimeEvents {
    sender: broadcast::Sender<RuntimeEvent>,
    retained: DashMap<String, RuntimeEvent>,
}

impl RuntimeEvents {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(256);
        Arc::new(Self { sender, retained: DashMap::new() })
    }

    pub fn emit(&self, id: &str, payload: Value) {
        self.publish(id, payload, false);
    }

    pub fn emit_retained(&self, id: &str, payload: Value) {
        self.publish(id, payload, true);
    }

    fn publish(&self, id: &str, payload: Value, retained: bool) {
        let event = RuntimeEvent {
            id: id.to_string(),
            payload,
            retained,
            at: Utc::now(),
        };
        if retained {
            self.retained.insert(event.id.clone(), event.clone());
        }
        // nobody listening is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn retained(&self, id: &str) -> Option<RuntimeEvent> {
        self.retained.get(id).map(|e| e.value().clone())
    }

    pub fn clear_retained(&self, id: &str) {
        self.retained.remove(id);
    }
}
