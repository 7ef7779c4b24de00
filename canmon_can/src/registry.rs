//! Driver registry for CAN bus drivers.
//!
//! Provides a `DriverRegistry` struct for registering and retrieving bus
//! driver factories. Constructor-injection rather than global state.

use crate::driver::{CanDriver, DriverFactory};
use crate::error::CanError;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available CAN drivers.
///
/// Constructed at startup, populated via `register()`, and handed to the
/// supervisor by value. No global state — testable in isolation.
pub struct DriverRegistry {
    factories: HashMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with all built-in drivers registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("sim", || Arc::new(crate::sim::SimCanDriver::new()));
        registry
    }

    /// Register a driver factory.
    ///
    /// # Panics
    /// Panics if a driver with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: DriverFactory) {
        if self.factories.contains_key(name) {
            panic!("Driver '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    /// Create a driver instance by name.
    ///
    /// # Errors
    /// Returns `CanError::DriverInstall` if no driver with the given name
    /// is registered.
    pub fn create_driver(&self, name: &str) -> Result<Arc<dyn CanDriver>, CanError> {
        let factory = self
            .factories
            .get(name)
            .copied()
            .ok_or_else(|| CanError::DriverInstall(format!("no such driver: {name}")))?;
        Ok(factory())
    }

    /// List all registered driver names.
    pub fn list_drivers(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_register_and_create() {
        let registry = DriverRegistry::with_builtin();
        let driver = registry.create_driver("sim").expect("should create");
        assert_eq!(driver.name(), "sim");
    }

    #[test]
    fn registry_driver_not_found() {
        let registry = DriverRegistry::new();
        let result = registry.create_driver("nonexistent");
        assert!(matches!(result, Err(CanError::DriverInstall(_))));
    }

    #[test]
    fn registry_list_drivers() {
        let registry = DriverRegistry::with_builtin();
        assert_eq!(registry.list_drivers(), vec!["sim"]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn registry_duplicate_panics() {
        let mut registry = DriverRegistry::with_builtin();
        registry.register("sim", || Arc::new(crate::sim::SimCanDriver::new()));
    }
}
