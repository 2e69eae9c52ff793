//! Store configuration.

/// Explicit schema for a store: the entity collections it serves.
///
/// Collections must be declared up front; requests naming an unknown
/// collection are rejected as validation errors. This replaces ambient
/// name-to-type registries with configuration passed at construction.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    entity_names: Vec<String>,
}

impl StoreConfig {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an entity collection.
    #[must_use]
    pub fn with_entity(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.entity_names.contains(&name) {
            self.entity_names.push(name);
        }
        self
    }

    /// Returns the declared collection names.
    pub fn entity_names(&self) -> &[String] {
        &self.entity_names
    }

    /// Returns true if `name` is a declared collection.
    pub fn allows(&self, name: &str) -> bool {
        self.entity_names.iter().any(|n| n == name)
    }
}
