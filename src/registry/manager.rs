use std::sync::Arc;

use dashmap::DashMap;
use moka::future::Cache;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{RuntimeEvents, topic};
use crate::flow::node::NodeConstructor;
use crate::hooks::{HookManager, HookPayload, ModuleEvent};
use crate::registry::{ModuleDescriptor, NodeSetDescriptor, TypeBinding};
use crate::settings::SettingsManager;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module `{0}` is already registered")]
    ModuleAlreadyRegistered(String),
    #[error("unknown module `{0}`")]
    UnknownModule(String),
    #[error("unknown node set `{0}`")]
    UnknownNodeSet(String),
    #[error("type `{type_name}` is not declared by node set `{set}`")]
    UndeclaredType { set: String, type_name: String },
    #[error("type `{0}` already has a registered constructor")]
    TypeAlreadyRegistered(String),
    #[error("module `{module}` install blocked: {reason}")]
    InstallBlocked { module: String, reason: String },
    #[error(transparent)]
    Settings(#[from] crate::settings::SettingsError),
}

/// The node-type and module catalog.
///
/// Holds which modules are present, which node sets they declare, and the
/// constructor bound to each type name. Flow instantiation only ever asks
/// one question of it: `get_constructor(type)`.
pub struct NodeRegistry {
    modules: DashMap<String, ModuleDescriptor>,
    types: DashMap<String, TypeBinding>,
    constructors: DashMap<String, NodeConstructor>,
    /// Rendered per-type config blobs, invalidated on any catalog change.
    config_cache: Cache<String, String>,
    events: Arc<RuntimeEvents>,
    hooks: Arc<HookManager>,
    settings: Arc<SettingsManager>,
}

impl NodeRegistry {
    pub fn new(
        events: Arc<RuntimeEvents>,
        hooks: Arc<HookManager>,
        settings: Arc<SettingsManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            modules: DashMap::new(),
            types: DashMap::new(),
            constructors: DashMap::new(),
            config_cache: Cache::new(1024),
            events,
            hooks,
            settings,
        })
    }

    /// Register a module and bind the types its node sets declare.
    ///
    /// A type already owned by another module is a conflict for the whole
    /// declaring set: the set is marked errored and none of its types bind.
    /// The earlier binding always wins and the conflict is not an error for
    /// the caller.
    pub fn add_module(&self, mut module: ModuleDescriptor) -> Result<(), RegistryError> {
        if self.modules.contains_key(&module.name) {
            return Err(RegistryError::ModuleAlreadyRegistered(module.name));
        }

        let mut event = HookPayload::Module(ModuleEvent {
            module: module.name.clone(),
            version: Some(module.version.clone()),
        });
        if let Err(failure) = self.hooks.trigger("preInstall", &mut event) {
            return Err(RegistryError::InstallBlocked {
                module: module.name,
                reason: failure.reason,
            });
        }

        for set in module.sets.values_mut() {
            let conflict = set.types.iter().find_map(|t| {
                self.types
                    .get(t)
                    .map(|owner| (t.clone(), owner.module.clone()))
            });
            if let Some((type_name, owner)) = conflict {
                let message =
                    format!("type `{type_name}` already registered by module `{owner}`");
                warn!(set = %set.id, %message, "node set not registered");
                set.err = Some(message);
                continue;
            }
            for type_name in &set.types {
                self.types.insert(
                    type_name.clone(),
                    TypeBinding {
                        module: module.name.clone(),
                        set: set.name.clone(),
                    },
                );
            }
        }

        for dep in module.dependencies.clone() {
            if let Some(mut dep_module) = self.modules.get_mut(&dep) {
                if !dep_module.used_by.contains(&module.name) {
                    dep_module.used_by.push(module.name.clone());
                }
            }
        }

        info!(module = %module.name, version = %module.version, "module registered");
        self.modules.insert(module.name.clone(), module.clone());
        self.config_cache.invalidate_all();

        let mut event = HookPayload::Module(ModuleEvent {
            module: module.name.clone(),
            version: Some(module.version.clone()),
        });
        let _ = self.hooks.trigger("postInstall", &mut event);
        Ok(())
    }

    /// Bind an implementation to an already-declared type.
    pub fn register_node_constructor(
        &self,
        set_id: &str,
        type_name: &str,
        constructor: NodeConstructor,
    ) -> Result<(), RegistryError> {
        let set = self
            .find_set(set_id)
            .ok_or_else(|| RegistryError::UnknownNodeSet(set_id.to_string()))?;
        if !set.types.iter().any(|t| t == type_name) {
            return Err(RegistryError::UndeclaredType {
                set: set_id.to_string(),
                type_name: type_name.to_string(),
            });
        }
        if self.constructors.contains_key(type_name) {
            return Err(RegistryError::TypeAlreadyRegistered(type_name.to_string()));
        }
        self.constructors
            .insert(type_name.to_string(), constructor);
        debug!(r#type = type_name, set = set_id, "constructor registered");
        self.events
            .emit(topic::TYPE_REGISTERED, json!({ "type": type_name }));
        Ok(())
    }

    /// The constructor for a type, if its set is enabled and healthy.
    ///
    /// Disabled and errored sets resolve to nothing; callers treat that as
    /// a missing type, not an error.
    pub fn get_constructor(&self, type_name: &str) -> Option<NodeConstructor> {
        let binding = self.types.get(type_name)?;
        let module = self.modules.get(&binding.module)?;
        let set = module.sets.get(&binding.set)?;
        if !set.available() {
            return None;
        }
        self.constructors.get(type_name).map(|c| c.value().clone())
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.get_constructor(type_name).is_some()
    }

    pub fn get_module(&self, name: &str) -> Option<ModuleDescriptor> {
        self.modules.get(name).map(|m| m.value().clone())
    }

    pub fn get_node_set(&self, set_id: &str) -> Option<NodeSetDescriptor> {
        self.find_set(set_id)
    }

    pub fn list_modules(&self) -> Vec<ModuleDescriptor> {
        self.modules.iter().map(|m| m.value().clone()).collect()
    }

    pub async fn enable_node_set(&self, set_id: &str) -> Result<(), RegistryError> {
        self.set_node_set_state(set_id, true).await
    }

    pub async fn disable_node_set(&self, set_id: &str) -> Result<(), RegistryError> {
        self.set_node_set_state(set_id, false).await
    }

    async fn set_node_set_state(&self, set_id: &str, enabled: bool) -> Result<(), RegistryError> {
        let (module_name, set_name) = split_set_id(set_id)
            .ok_or_else(|| RegistryError::UnknownNodeSet(set_id.to_string()))?;
        {
            let mut module = self
                .modules
                .get_mut(module_name)
                .ok_or_else(|| RegistryError::UnknownModule(module_name.to_string()))?;
            let set = module
                .sets
                .get_mut(set_name)
                .ok_or_else(|| RegistryError::UnknownNodeSet(set_id.to_string()))?;
            set.enabled = enabled;
        }
        self.config_cache.invalidate_all();
        self.persist_set_states().await?;
        Ok(())
    }

    /// Remove one node set from its module, unbinding its types.
    pub fn remove_node_set(&self, set_id: &str) -> Result<NodeSetDescriptor, RegistryError> {
        let (module_name, set_name) = split_set_id(set_id)
            .ok_or_else(|| RegistryError::UnknownNodeSet(set_id.to_string()))?;
        let removed = {
            let mut module = self
                .modules
                .get_mut(module_name)
                .ok_or_else(|| RegistryError::UnknownModule(module_name.to_string()))?;
            module
                .sets
                .remove(set_name)
                .ok_or_else(|| RegistryError::UnknownNodeSet(set_id.to_string()))?
        };
        self.unbind_types(&removed);
        self.config_cache.invalidate_all();
        Ok(removed)
    }

    /// Stage a module update: the new version takes effect at the next
    /// restart, and the operator is told one is needed.
    pub fn set_pending_version(&self, name: &str, version: &str) -> Result<(), RegistryError> {
        {
            let mut module = self
                .modules
                .get_mut(name)
                .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;
            module.pending_version = Some(version.to_string());
        }
        self.events.emit_retained(
            topic::RESTART_REQUIRED,
            json!({ "module": name, "version": version }),
        );
        Ok(())
    }

    /// Remove a module, or demote it when something still depends on it.
    ///
    /// Returns the names of every module actually removed: the module itself
    /// plus any of its dependencies that became unused and were not
    /// user-installed.
    pub fn remove_module(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        if !self.modules.contains_key(name) {
            return Err(RegistryError::UnknownModule(name.to_string()));
        }

        let has_dependents = self
            .modules
            .get(name)
            .map(|m| !m.used_by.is_empty())
            .unwrap_or(false);
        if has_dependents {
            if let Some(mut module) = self.modules.get_mut(name) {
                module.user = false;
                info!(module = name, "module still in use, demoted to dependency");
            }
            return Ok(Vec::new());
        }

        let mut event = HookPayload::Module(ModuleEvent {
            module: name.to_string(),
            version: None,
        });
        let _ = self.hooks.trigger("preUninstall", &mut event);

        let mut removed = Vec::new();
        self.remove_module_inner(name, &mut removed);
        self.config_cache.invalidate_all();

        let mut event = HookPayload::Module(ModuleEvent {
            module: name.to_string(),
            version: None,
        });
        let _ = self.hooks.trigger("postUninstall", &mut event);
        Ok(removed)
    }

    fn remove_module_inner(&self, name: &str, removed: &mut Vec<String>) {
        let Some((_, module)) = self.modules.remove(name) else {
            return;
        };
        for set in module.sets.values() {
            self.unbind_types(set);
        }
        removed.push(module.name.clone());
        info!(module = %module.name, "module removed");

        for dep in &module.dependencies {
            let now_unused = {
                let Some(mut dep_module) = self.modules.get_mut(dep) else {
                    continue;
                };
                dep_module.used_by.retain(|u| u != name);
                dep_module.used_by.is_empty() && !dep_module.user
            };
            if now_unused {
                self.remove_module_inner(dep, removed);
            }
        }
    }

    fn unbind_types(&self, set: &NodeSetDescriptor) {
        if set.err.is_some() {
            // an errored set never bound anything
            return;
        }
        for type_name in &set.types {
            let owned = self
                .types
                .get(type_name)
                .map(|b| b.module == set.module && b.set == set.name)
                .unwrap_or(false);
            if owned {
                self.types.remove(type_name);
                self.constructors.remove(type_name);
            }
        }
    }

    /// Rendered config blob for a type, cached until the catalog changes.
    pub async fn get_node_config(&self, type_name: &str) -> Option<String> {
        let binding = self.types.get(type_name).map(|b| b.value().clone())?;
        let set = self.find_set(&format!("{}/{}", binding.module, binding.set))?;
        let key = type_name.to_string();
        Some(
            self.config_cache
                .get_with(key, async move {
                    json!({
                        "type": type_name,
                        "module": binding.module,
                        "set": set.name,
                        "version": set.version,
                        "enabled": set.available(),
                    })
                    .to_string()
                })
                .await,
        )
    }

    async fn persist_set_states(&self) -> Result<(), RegistryError> {
        let mut states = serde_json::Map::new();
        for module in self.modules.iter() {
            for set in module.sets.values() {
                states.insert(set.id.clone(), json!({ "enabled": set.enabled }));
            }
        }
        self.settings
            .set("nodes", serde_json::Value::Object(states))
            .await?;
        Ok(())
    }

    fn find_set(&self, set_id: &str) -> Option<NodeSetDescriptor> {
        let (module_name, set_name) = split_set_id(set_id)?;
        self.modules
            .get(module_name)
            .and_then(|m| m.sets.get(set_name).cloned())
    }
}

fn split_set_id(set_id: &str) -> Option<(&str, &str)> {
    set_id.rsplit_once('/')
}
