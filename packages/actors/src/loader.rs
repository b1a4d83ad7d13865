//! Resolving handler source text into factories.
//!
//! Handlers are never discovered by scanning; a factory must be registered
//! under an entry name, and the definition's source text names that entry.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_core::HandlerDefinition;
use serde::Deserialize;
use serde_json::Value;

use crate::logic::HandlerFactory;

/// Why source text could not be turned into a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("cannot parse handler source: {0}")]
    Parse(String),

    #[error("handler '{entry}' rejected its parameters: {message}")]
    Compile { entry: String, message: String },

    #[error("no handler registered for entry '{0}'")]
    MissingInitializer(String),
}

/// A loaded handler: the factory plus the parameters to build it with.
#[derive(Clone)]
pub struct LoadedHandler {
    pub entry: String,
    pub factory: Arc<dyn HandlerFactory>,
    pub params: Value,
}

impl LoadedHandler {
    pub fn new(entry: impl Into<String>, factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            entry: entry.into(),
            factory,
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

impl std::fmt::Debug for LoadedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedHandler")
            .field("entry", &self.entry)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Turns a definition's source text into a [`LoadedHandler`].
pub trait HandlerLoader: Send + Sync + 'static {
    fn load(&self, definition: &HandlerDefinition) -> Result<LoadedHandler, LoadError>;
}

#[derive(Deserialize)]
struct SourceDescriptor {
    entry: String,
    #[serde(default)]
    params: Value,
}

/// Loader backed by an explicit table of registered factories.
///
/// Source text is a JSON descriptor: `{"entry": "<name>", "params": {...}}`.
#[derive(Default)]
pub struct FactoryLoader {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl FactoryLoader {
    /// Create a new empty loader.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under an entry name.
    pub fn register(&mut self, entry: impl Into<String>, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(entry.into(), factory);
    }

    /// Builder-style [`FactoryLoader::register`].
    pub fn with(mut self, entry: impl Into<String>, factory: Arc<dyn HandlerFactory>) -> Self {
        self.register(entry, factory);
        self
    }

    /// Get a factory by entry name.
    pub fn get(&self, entry: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.factories.get(entry).cloned()
    }

    /// List all registered entry names.
    pub fn entries(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl HandlerLoader for FactoryLoader {
    fn load(&self, definition: &HandlerDefinition) -> Result<LoadedHandler, LoadError> {
        let descriptor: SourceDescriptor = serde_json::from_str(&definition.source)
            .map_err(|e| LoadError::Parse(format!("{}: {}", definition.name, e)))?;

        let entry = descriptor.entry.trim();
        if entry.is_empty() {
            return Err(LoadError::Parse(format!("{}: empty entry", definition.name)));
        }

        let factory = self
            .get(entry)
            .ok_or_else(|| LoadError::MissingInitializer(entry.to_string()))?;

        factory
            .validate(&descriptor.params)
            .map_err(|message| LoadError::Compile {
                entry: entry.to_string(),
                message,
            })?;

        Ok(LoadedHandler::new(entry, factory).with_params(descriptor.params))
    }
}
