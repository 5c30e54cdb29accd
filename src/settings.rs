use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::storage::{Storage, StorageError};

/// Key that must never go through general get/set; user data has its own
/// accessors so callers cannot read another user's settings by path.
const RESERVED_USER_KEY: &str = "users";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings key `{0}` is reserved")]
    Reserved(String),
    #[error("settings key `{0}` is read-only")]
    ReadOnly(String),
    #[error("invalid settings key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Hierarchical runtime settings backed by the storage collaborator.
///
/// Keys pre-declared by the host at initialization shadow the stored tree
/// and are read-only at runtime. Saves are serialized through one mutex so
/// two concurrent writers cannot interleave a persisted snapshot.
pub struct SettingsManager {
    storage: Storage,
    tree: tokio::sync::RwLock<Map<String, Value>>,
    fixed: Map<String, Value>,
    save_lock: tokio::sync::Mutex<()>,
}

impl SettingsManager {
    pub async fn init(storage: Storage, fixed: Map<String, Value>) -> Result<Arc<Self>, SettingsError> {
        let stored = storage.get_settings().await?;
        let tree = match stored {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Arc::new(Self {
            storage,
            tree: tokio::sync::RwLock::new(tree),
            fixed,
            save_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Read a dotted path, e.g. `editor.theme`.
    pub async fn get(&self, path: &str) -> Result<Option<Value>, SettingsError> {
        let (root, rest) = split_key(path)?;
        if root == RESERVED_USER_KEY {
            return Err(SettingsError::Reserved(path.to_string()));
        }
        if let Some(fixed) = self.fixed.get(root) {
            return Ok(lookup(fixed, rest).cloned());
        }
        let tree = self.tree.read().await;
        Ok(tree.get(root).and_then(|v| lookup(v, rest)).cloned())
    }

    /// Write a dotted path and persist the tree.
    pub async fn set(&self, path: &str, value: Value) -> Result<(), SettingsError> {
        let (root, rest) = split_key(path)?;
        if root == RESERVED_USER_KEY {
            return Err(SettingsError::Reserved(path.to_string()));
        }
        if self.fixed.contains_key(root) {
            return Err(SettingsError::ReadOnly(path.to_string()));
        }
        {
            let mut tree = self.tree.write().await;
            let slot = tree.entry(root.to_string()).or_insert(Value::Null);
            write(slot, rest, value);
        }
        self.save().await
    }

    pub async fn delete(&self, path: &str) -> Result<(), SettingsError> {
        let (root, rest) = split_key(path)?;
        if root == RESERVED_USER_KEY {
            return Err(SettingsError::Reserved(path.to_string()));
        }
        if self.fixed.contains_key(root) {
            return Err(SettingsError::ReadOnly(path.to_string()));
        }
        {
            let mut tree = self.tree.write().await;
            if rest.is_empty() {
                tree.remove(root);
            } else if let Some(slot) = tree.get_mut(root) {
                remove(slot, rest);
            }
        }
        self.save().await
    }

    /// Per-user settings live under the reserved subtree.
    pub async fn get_user_settings(&self, username: &str) -> Option<Value> {
        let tree = self.tree.read().await;
        tree.get(RESERVED_USER_KEY)
            .and_then(|users| users.get(username))
            .cloned()
    }

    pub async fn set_user_settings(&self, username: &str, value: Value) -> Result<(), SettingsError> {
        {
            let mut tree = self.tree.write().await;
            let users = tree
                .entry(RESERVED_USER_KEY.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !users.is_object() {
                *users = Value::Object(Map::new());
            }
            if let Some(map) = users.as_object_mut() {
                map.insert(username.to_string(), value);
            }
        }
        self.save().await
    }

    async fn save(&self) -> Result<(), SettingsError> {
        // one save in flight at a time
        let _guard = self.save_lock.lock().await;
        let snapshot = {
            let tree = self.tree.read().await;
            Value::Object(tree.clone())
        };
        debug!("persisting settings");
        self.storage.save_settings(snapshot).await?;
        Ok(())
    }
}

fn split_key(path: &str) -> Result<(&str, Vec<&str>), SettingsError> {
    let mut parts = path.split('.');
    let root = parts.next().unwrap_or("");
    if root.is_empty() {
        return Err(SettingsError::InvalidKey(path.to_string()));
    }
    let rest: Vec<&str> = parts.collect();
    if rest.iter().any(|p| p.is_empty()) {
        return Err(SettingsError::InvalidKey(path.to_string()));
    }
    Ok((root, rest))
}

fn lookup<'a>(mut current: &'a Value, path: Vec<&str>) -> Option<&'a Value> {
    for part in path {
        current = current.get(part)?;
    }
    Some(current)
}

fn write(slot: &mut Value, path: Vec<&str>, value: Value) {
    let mut current = slot;
    for part in path {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(part.to_string())
            .or_insert(Value::Null);
    }
    *current = value;
}

fn remove(slot: &mut Value, path: Vec<&str>) {
    let Some((last, stem)) = path.split_last() else {
        return;
    };
    let mut current = slot;
    for part in stem {
        match current.get_mut(*part) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(*last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    async fn manager(fixed: Map<String, Value>) -> Arc<SettingsManager> {
        SettingsManager::init(Storage(InMemoryStorage::new()), fixed)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_set_nested_keys() {
        let settings = manager(Map::new()).await;
        settings.set("editor.theme", json!("dark")).await.unwrap();

        assert_eq!(settings.get("editor.theme").await.unwrap(), Some(json!("dark")));
        assert_eq!(settings.get("editor").await.unwrap(), Some(json!({"theme": "dark"})));
        assert_eq!(settings.get("missing.key").await.unwrap(), None);

        settings.delete("editor.theme").await.unwrap();
        assert_eq!(settings.get("editor.theme").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settings_survive_a_reload() {
        let backend = InMemoryStorage::new();
        let settings = SettingsManager::init(Storage(backend.clone()), Map::new())
            .await
            .unwrap();
        settings.set("palette", json!(["red"])).await.unwrap();

        let reloaded = SettingsManager::init(Storage(backend), Map::new())
            .await
            .unwrap();
        assert_eq!(reloaded.get("palette").await.unwrap(), Some(json!(["red"])));
    }

    #[tokio::test]
    async fn test_users_key_is_reserved() {
        let settings = manager(Map::new()).await;
        assert!(matches!(
            settings.get("users").await,
            Err(SettingsError::Reserved(_))
        ));
        assert!(matches!(
            settings.set("users.admin", json!({})).await,
            Err(SettingsError::Reserved(_))
        ));

        settings
            .set_user_settings("admin", json!({"lang": "en"}))
            .await
            .unwrap();
        assert_eq!(
            settings.get_user_settings("admin").await,
            Some(json!({"lang": "en"}))
        );
        assert_eq!(settings.get_user_settings("other").await, None);
    }

    #[tokio::test]
    async fn test_host_declared_keys_are_read_only() {
        let mut fixed = Map::new();
        fixed.insert("httpPort".to_string(), json!(1880));
        let settings = manager(fixed).await;

        assert_eq!(settings.get("httpPort").await.unwrap(), Some(json!(1880)));
        assert!(matches!(
            settings.set("httpPort", json!(9999)).await,
            Err(SettingsError::ReadOnly(_))
        ));
        assert!(matches!(
            settings.delete("httpPort").await,
            Err(SettingsError::ReadOnly(_))
        ));
    }
}
