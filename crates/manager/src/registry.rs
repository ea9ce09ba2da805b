use std::collections::HashMap;

use crate::error::RegistryError;
use crate::handler::HandlerFactory;
use crate::handlers;

/// Maps stable handler identifiers to their factories.
///
/// Names are checked when they are registered, so resolving a name at
/// dispatch time is a plain lookup.
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding every handler compiled into this crate.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for (name, factory) in handlers::BUILTIN {
            registry.register(name, *factory)?;
        }
        Ok(registry)
    }

    /// Register a factory. Fails on an empty or already-taken name.
    pub fn register(&mut self, name: &str, factory: HandlerFactory) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.factories.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Look up a factory by handler identifier.
    pub fn resolve(&self, name: &str) -> Option<HandlerFactory> {
        self.factories.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::echo::{self, EchoHandler};

    #[test]
    fn builtin_contains_echo() {
        let registry = HandlerRegistry::builtin().unwrap();
        assert!(registry.contains(echo::NAME));
        assert!(registry.resolve("EchoHandler").is_some());
        assert_eq!(registry.names(), vec!["EchoHandler"]);
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let registry = HandlerRegistry::builtin().unwrap();
        assert!(registry.resolve("NoSuchHandler").is_none());
        assert!(registry.resolve("echohandler").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register("EchoHandler", EchoHandler::from_params).unwrap();
        let err = registry
            .register("EchoHandler", EchoHandler::from_params)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "EchoHandler"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut registry = HandlerRegistry::default();
        assert!(matches!(
            registry.register(" ", EchoHandler::from_params),
            Err(RegistryError::EmptyName)
        ));
        assert!(registry.is_empty());
    }
}
