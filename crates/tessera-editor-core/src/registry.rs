//! Registries consulted when materializing components and formats.

use std::collections::{HashMap, HashSet};

use smol_str::SmolStr;

use crate::types::ContentType;

/// What the model needs to know to instantiate a component by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentSchema {
    pub name: SmolStr,
    pub content_type: ContentType,
}

/// Resolves component names to their schema.
pub trait ComponentRegistry {
    fn lookup_component(&self, name: &str) -> Option<ComponentSchema>;
}

/// Answers whether inline format keys and block attribute keys are known.
///
/// Unknown keys arriving from peers are dropped rather than stored.
pub trait FormatRegistry {
    fn has_formatter(&self, key: &str) -> bool;
    fn has_attribute(&self, key: &str) -> bool;
}

/// In-memory registry covering both components and formats.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    components: HashMap<SmolStr, ComponentSchema>,
    formatters: HashSet<SmolStr>,
    attributes: HashSet<SmolStr>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_component(&mut self, name: impl Into<SmolStr>, content_type: ContentType) {
        let name = name.into();
        self.components.insert(
            name.clone(),
            ComponentSchema { name, content_type },
        );
    }

    pub fn register_formatter(&mut self, key: impl Into<SmolStr>) {
        self.formatters.insert(key.into());
    }

    pub fn register_attribute(&mut self, key: impl Into<SmolStr>) {
        self.attributes.insert(key.into());
    }

    pub fn with_component(mut self, name: impl Into<SmolStr>, content_type: ContentType) -> Self {
        self.register_component(name, content_type);
        self
    }

    pub fn with_formatter(mut self, key: impl Into<SmolStr>) -> Self {
        self.register_formatter(key);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<SmolStr>) -> Self {
        self.register_attribute(key);
        self
    }

    /// Schema for a name, for hosts building components locally.
    pub fn schema(&self, name: &str) -> Option<&ComponentSchema> {
        self.components.get(name)
    }
}

impl ComponentRegistry for Registry {
    fn lookup_component(&self, name: &str) -> Option<ComponentSchema> {
        self.components.get(name).cloned()
    }
}

impl FormatRegistry for Registry {
    fn has_formatter(&self, key: &str) -> bool {
        self.formatters.contains(key)
    }

    fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains(key)
    }
}
