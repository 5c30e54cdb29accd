use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::flow::config::RawNode;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("forbidden path `{0}`")]
    Forbidden(String),
    #[error("library entry `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The persisted flow set plus its advisory revision token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredFlows {
    pub flows: Vec<RawNode>,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

/// Persistence collaborator consumed by the runtime; the runtime never
/// implements durability itself.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_flows(&self) -> Result<StoredFlows, StorageError>;
    async fn save_flows(&self, flows: StoredFlows) -> Result<(), StorageError>;
    async fn get_settings(&self) -> Result<Value, StorageError>;
    async fn save_settings(&self, settings: Value) -> Result<(), StorageError>;
    async fn get_sessions(&self) -> Result<Value, StorageError>;
    async fn save_sessions(&self, sessions: Value) -> Result<(), StorageError>;
    async fn get_library_entry(&self, kind: &str, path: &str) -> Result<Value, StorageError>;
    async fn save_library_entry(
        &self,
        kind: &str,
        path: &str,
        body: Value,
    ) -> Result<(), StorageError>;
}

/// Front door to the storage backend.
///
/// Library paths are validated here, before any backend sees them.
#[derive(Clone)]
pub struct Storage(pub Arc<dyn StorageBackend>);

impl Storage {
    pub async fn get_flows(&self) -> Result<StoredFlows, StorageError> {
        self.0.get_flows().await
    }

    pub async fn save_flows(&self, flows: StoredFlows) -> Result<(), StorageError> {
        self.0.save_flows(flows).await
    }

    pub async fn get_settings(&self) -> Result<Value, StorageError> {
        self.0.get_settings().await
    }

    pub async fn save_settings(&self, settings: Value) -> Result<(), StorageError> {
        self.0.save_settings(settings).await
    }

    pub async fn get_sessions(&self) -> Result<Value, StorageError> {
        self.0.get_sessions().await
    }

    pub async fn save_sessions(&self, sessions: Value) -> Result<(), StorageError> {
        self.0.save_sessions(sessions).await
    }

    pub async fn get_library_entry(&self, kind: &str, path: &str) -> Result<Value, StorageError> {
        validate_library_path(path)?;
        self.0.get_library_entry(kind, path).await
    }

    pub async fn save_library_entry(
        &self,
        kind: &str,
        path: &str,
        body: Value,
    ) -> Result<(), StorageError> {
        validate_library_path(path)?;
        self.0.save_library_entry(kind, path, body).await
    }
}

fn validate_library_path(path: &str) -> Result<(), StorageError> {
    if path.contains("../") || path.contains("..\\") {
        return Err(StorageError::Forbidden(path.to_string()));
    }
    Ok(())
}

/// Keeps everything in process memory. Test double and embedded default.
#[derive(Default)]
pub struct InMemoryStorage {
    flows: tokio::sync::Mutex<StoredFlows>,
    settings: tokio::sync::Mutex<Value>,
    sessions: tokio::sync::Mutex<Value>,
    library: DashMap<String, Value>,
}

impl InMemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_flows(flows: StoredFlows) -> Arc<Self> {
        Arc::new(Self {
            flows: tokio::sync::Mutex::new(flows),
            ..Self::default()
        })
    }

    fn library_key(kind: &str, path: &str) -> String {
        format!("{kind}:{path}")
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn get_flows(&self) -> Result<StoredFlows, StorageError> {
        Ok(self.flows.lock().await.clone())
    }

    async fn save_flows(&self, flows: StoredFlows) -> Result<(), StorageError> {
        *self.flows.lock().await = flows;
        Ok(())
    }

    async fn get_settings(&self) -> Result<Value, StorageError> {
        Ok(self.settings.lock().await.clone())
    }

    async fn save_settings(&self, settings: Value) -> Result<(), StorageError> {
        *self.settings.lock().await = settings;
        Ok(())
    }

    async fn get_sessions(&self) -> Result<Value, StorageError> {
        Ok(self.sessions.lock().await.clone())
    }

    async fn save_sessions(&self, sessions: Value) -> Result<(), StorageError> {
        *self.sessions.lock().await = sessions;
        Ok(())
    }

    async fn get_library_entry(&self, kind: &str, path: &str) -> Result<Value, StorageError> {
        self.library
            .get(&Self::library_key(kind, path))
            .map(|v| v.value().clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn save_library_entry(
        &self,
        kind: &str,
        path: &str,
        body: Value,
    ) -> Result<(), StorageError> {
        self.library.insert(Self::library_key(kind, path), body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::config::RawNode;
    use serde_json::json;

    #[tokio::test]
    async fn test_flow_round_trip() {
        let storage = Storage(InMemoryStorage::new());
        let stored = StoredFlows {
            flows: vec![RawNode::new("t1", "tab")],
            credentials: json!({}),
            rev: Some("abc".into()),
        };
        storage.save_flows(stored.clone()).await.unwrap();

        let loaded = storage.get_flows().await.unwrap();
        assert_eq!(loaded.rev.as_deref(), Some("abc"));
        assert_eq!(loaded.flows.len(), 1);
        assert_eq!(loaded.flows[0].id, "t1");
    }

    #[tokio::test]
    async fn test_library_entries() {
        let storage = Storage(InMemoryStorage::new());
        storage
            .save_library_entry("flows", "shared/a", json!({"v": 1}))
            .await
            .unwrap();
        let entry = storage.get_library_entry("flows", "shared/a").await.unwrap();
        assert_eq!(entry, json!({"v": 1}));

        assert!(matches!(
            storage.get_library_entry("flows", "missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected_before_the_backend() {
        let backend = InMemoryStorage::new();
        let storage = Storage(backend.clone());

        for path in ["../etc/passwd", "a/../../b", "a\\..\\b"] {
            assert!(matches!(
                storage.get_library_entry("flows", path).await,
                Err(StorageError::Forbidden(_))
            ));
            assert!(matches!(
                storage.save_library_entry("flows", path, json!(null)).await,
                Err(StorageError::Forbidden(_))
            ));
        }
        // nothing reached the backend
        assert!(backend.library.is_empty());
    }
}
