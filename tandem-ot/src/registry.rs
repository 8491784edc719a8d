//! Explicit registry of OT types.
//!
//! There is no process-wide registry: the authority and every client
//! connection receive a `TypeRegistry` when they are built.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{Json0, OtError, OtType, Text};

#[derive(Clone, Default)]
pub struct TypeRegistry {
    /// Keyed by both short name and URI.
    types: HashMap<String, Arc<dyn OtType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `json0` and `text`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Json0));
        registry.register(Arc::new(Text));
        registry
    }

    /// Registers a type under its name and URI, replacing any previous
    /// type with the same keys.
    pub fn register(&mut self, ty: Arc<dyn OtType>) {
        log::debug!("Registering OT type {} ({})", ty.name(), ty.uri());
        self.types.insert(ty.name().to_string(), Arc::clone(&ty));
        self.types.insert(ty.uri().to_string(), ty);
    }

    pub fn get(&self, name_or_uri: &str) -> Option<Arc<dyn OtType>> {
        self.types.get(name_or_uri).cloned()
    }

    pub fn require(&self, name_or_uri: &str) -> Result<Arc<dyn OtType>, OtError> {
        self.get(name_or_uri)
            .ok_or_else(|| OtError::UnknownType(name_or_uri.to_string()))
    }

    /// Canonical URIs of every registered type, sorted.
    pub fn uris(&self) -> Vec<&'static str> {
        let mut uris: Vec<&'static str> = self.types.values().map(|t| t.uri()).collect();
        uris.sort_unstable();
        uris.dedup();
        uris
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry").field("types", &self.uris()).finish()
    }
}
