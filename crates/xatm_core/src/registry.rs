//! Registry of resources allowed to take part in transactions.

use crate::error::{TmError, TmResult};
use parking_lot::RwLock;
use std::collections::HashMap;

/// How a registered resource takes part in two-phase commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRegistration {
    /// Unique name of the resource.
    pub unique_name: String,
    /// Resources with lower positions are prepared and committed first and
    /// rolled back last.
    pub two_pc_ordering_position: i32,
    /// Reuse an ended branch with TMJOIN when the same resource is enlisted
    /// again.
    pub use_tm_join: bool,
}

impl ResourceRegistration {
    /// Creates a registration with position 0 and TMJOIN enabled.
    pub fn new(unique_name: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            two_pc_ordering_position: 0,
            use_tm_join: true,
        }
    }

    /// Sets the two-phase commit ordering position.
    #[must_use]
    pub fn position(mut self, position: i32) -> Self {
        self.two_pc_ordering_position = position;
        self
    }

    /// Sets whether TMJOIN is used.
    #[must_use]
    pub fn use_tm_join(mut self, enabled: bool) -> Self {
        self.use_tm_join = enabled;
        self
    }
}

/// Unique name to registration map, shared by every transaction.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: RwLock<HashMap<String, ResourceRegistration>>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource.
    ///
    /// # Errors
    ///
    /// Returns [`TmError::IllegalState`] if the unique name is taken.
    pub fn register(&self, registration: ResourceRegistration) -> TmResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&registration.unique_name) {
            return Err(TmError::illegal_state(format!(
                "a resource with unique name '{}' is already registered",
                registration.unique_name
            )));
        }
        entries.insert(registration.unique_name.clone(), registration);
        Ok(())
    }

    /// Removes a registration.
    pub fn unregister(&self, unique_name: &str) -> Option<ResourceRegistration> {
        self.entries.write().remove(unique_name)
    }

    /// Looks a registration up.
    #[must_use]
    pub fn get(&self, unique_name: &str) -> Option<ResourceRegistration> {
        self.entries.read().get(unique_name).cloned()
    }

    /// Registered unique names, sorted.
    #[must_use]
    pub fn unique_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = ResourceRegistry::new();
        registry
            .register(ResourceRegistration::new("db").position(2).use_tm_join(false))
            .unwrap();

        let registration = registry.get("db").unwrap();
        assert_eq!(registration.two_pc_ordering_position, 2);
        assert!(!registration.use_tm_join);
        assert!(registry.get("queue").is_none());
    }

    #[test]
    fn duplicate_names_are_refused() {
        let registry = ResourceRegistry::new();
        registry.register(ResourceRegistration::new("db")).unwrap();
        let err = registry.register(ResourceRegistration::new("db")).unwrap_err();
        assert!(matches!(err, TmError::IllegalState { .. }));

        assert!(registry.unregister("db").is_some());
        assert!(registry.is_empty());
    }
}
