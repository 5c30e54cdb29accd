pub mod manager;

pub use manager::{NodeRegistry, RegistryError};

use std::collections::HashMap;

use serde::Serialize;

/// One type's place in the catalog.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TypeBinding {
    pub module: String,
    pub set: String,
}

/// A named group of node types shipped by a module.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeSetDescriptor {
    /// `<module>/<name>`.
    pub id: String,
    pub name: String,
    pub module: String,
    pub version: String,
    pub enabled: bool,
    /// Why registration failed, when it did. An errored set resolves none
    /// of its types.
    pub err: Option<String>,
    pub types: Vec<String>,
}

impl NodeSetDescriptor {
    pub fn new(module: &str, name: &str, types: Vec<&str>) -> Self {
        Self {
            id: format!("{module}/{name}"),
            name: name.to_string(),
            module: module.to_string(),
            version: String::new(),
            enabled: true,
            err: None,
            types: types.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn available(&self) -> bool {
        self.enabled && self.err.is_none()
    }
}

/// A module and the node sets it contributes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    pub pending_version: Option<String>,
    /// Whether the user installed this module directly, as opposed to it
    /// arriving as a dependency of something else.
    pub user: bool,
    pub sets: HashMap<String, NodeSetDescriptor>,
    pub dependencies: Vec<String>,
    /// Modules that depend on this one.
    pub used_by: Vec<String>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            pending_version: None,
            user: true,
            sets: HashMap::new(),
            dependencies: Vec::new(),
            used_by: Vec::new(),
        }
    }

    pub fn with_set(mut self, set: NodeSetDescriptor) -> Self {
        let mut set = set;
        set.module = self.name.clone();
        set.id = format!("{}/{}", self.name, set.name);
        if set.version.is_empty() {
            set.version = self.version.clone();
        }
        self.sets.insert(set.name.clone(), set);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn as_dependency(mut self) -> Self {
        self.user = false;
        self
    }
}
