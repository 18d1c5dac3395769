//! Backend registry: binds configured backend names to engine constructors.
//!
//! The embedding process builds one registry at startup, registers any extra
//! backends and calls [`EngineRegistry::init_database`] exactly once to get
//! its [`Store`].

use std::collections::BTreeMap;
use std::sync::Arc;

use agentdb_core::DatabaseConfig;
use tracing::info;

use crate::engine::{RedbEngine, StorageEngine};
use crate::error::{StateError, StateResult};
use crate::store::Store;

/// Builds an engine from the database section of the configuration.
pub type EngineFactory = fn(&DatabaseConfig) -> StateResult<Arc<dyn StorageEngine>>;

pub const REDB_BACKEND: &str = "redb";
pub const MEMORY_BACKEND: &str = "memory";

#[derive(Default)]
pub struct EngineRegistry {
    factories: BTreeMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the file-backed `redb` engine and the ephemeral `memory` engine.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(REDB_BACKEND, open_redb);
        registry.register(MEMORY_BACKEND, open_memory);
        registry
    }

    /// Register (or replace) a backend.
    pub fn register(&mut self, name: &str, factory: EngineFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Registered backend names, sorted.
    pub fn backends(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Validate `config`, then open the one configured backend.
    pub fn init_database(&self, config: &DatabaseConfig) -> StateResult<Store> {
        config.validate()?;
        let name = config.backend_name()?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StateError::Backend(name.to_string()))?;
        let engine = factory(config)?;
        info!(backend = name, path = ?config.db_file(), "agent database initialized");
        Ok(Store::from_engine(engine))
    }
}

fn open_redb(config: &DatabaseConfig) -> StateResult<Arc<dyn StorageEngine>> {
    let engine = RedbEngine::open(&config.db_file(), config.open_timeout())?;
    Ok(Arc::new(engine))
}

fn open_memory(_config: &DatabaseConfig) -> StateResult<Arc<dyn StorageEngine>> {
    Ok(Arc::new(RedbEngine::open_in_memory()?))
}
