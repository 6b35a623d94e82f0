//! Name-keyed plugin factories.
//!
//! Factories are registered explicitly at process start (see
//! [`register_builtin_plugins`](crate::plugins::register_builtin_plugins)), so
//! a pipeline can be built from configuration data alone.

use crate::plugin::FramePlugin;
use daq_core::{DaqError, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Builds plugin instances of one type.
pub trait PluginFactory: Send + Sync {
    /// Registry key, e.g. `compression`.
    fn plugin_type(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Create an instance. `instance_name` is the stage name, for logging.
    fn create(&self, instance_name: &str) -> Result<Box<dyn FramePlugin>>;
}

type CreateFn = dyn Fn(&str) -> Result<Box<dyn FramePlugin>> + Send + Sync;

struct FnFactory {
    plugin_type: String,
    description: String,
    create: Box<CreateFn>,
}

impl PluginFactory for FnFactory {
    fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn create(&self, instance_name: &str) -> Result<Box<dyn FramePlugin>> {
        (self.create)(instance_name)
    }
}

/// Table of plugin factories keyed by plugin type.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, Box<dyn PluginFactory>>,
}

impl PluginRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under its plugin type.
    ///
    /// Fails with [`DaqError::DuplicatePluginName`] if the type is taken; the
    /// existing factory stays registered.
    pub fn register(&mut self, factory: impl PluginFactory + 'static) -> Result<()> {
        let name = factory.plugin_type().to_string();
        if self.factories.contains_key(&name) {
            return Err(DaqError::DuplicatePluginName(name));
        }
        debug!(plugin_type = %name, "Registered plugin factory");
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Register a closure as the factory for `name`.
    pub fn register_fn<F>(&mut self, name: &str, description: &str, create: F) -> Result<()>
    where
        F: Fn(&str) -> Result<Box<dyn FramePlugin>> + Send + Sync + 'static,
    {
        self.register(FnFactory {
            plugin_type: name.to_string(),
            description: description.to_string(),
            create: Box::new(create),
        })
    }

    /// Instantiate a plugin of type `name` for the stage `instance_name`.
    pub fn create(&self, name: &str, instance_name: &str) -> Result<Box<dyn FramePlugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DaqError::UnknownPluginName(name.to_string()))?;
        factory.create(instance_name)
    }

    /// True if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered plugin types, sorted.
    #[must_use]
    pub fn plugin_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Description of `name`, if registered.
    #[must_use]
    pub fn description(&self, name: &str) -> Option<&str> {
        self.factories.get(name).map(|f| f.description())
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::Passthrough;

    fn passthrough(name: &str) -> Result<Box<dyn FramePlugin>> {
        Ok(Box::new(Passthrough::new(name)))
    }

    #[test]
    fn test_create_registered_plugin() {
        let mut registry = PluginRegistry::new();
        registry.register_fn("passthrough", "Forwards frames", passthrough).unwrap();
        let plugin = registry.create("passthrough", "stage-a").unwrap();
        assert_eq!(plugin.plugin_type(), "passthrough");
        assert_eq!(registry.description("passthrough"), Some("Forwards frames"));
    }

    #[test]
    fn test_unknown_name_is_configuration_error() {
        let mut registry = PluginRegistry::new();
        registry.register_fn("passthrough", "", passthrough).unwrap();

        let err = registry.create("UnknownName", "x").err().unwrap();
        assert!(matches!(err, DaqError::UnknownPluginName(ref n) if n == "UnknownName"));
        assert!(err.is_configuration());
        assert_eq!(registry.plugin_types(), vec!["passthrough"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register_fn("passthrough", "first", passthrough).unwrap();
        let err = registry.register_fn("passthrough", "second", passthrough).unwrap_err();
        assert!(matches!(err, DaqError::DuplicatePluginName(_)));
        assert_eq!(registry.description("passthrough"), Some("first"));
        assert_eq!(registry.len(), 1);
    }
}
