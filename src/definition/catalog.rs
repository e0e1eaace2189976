// src/definition/catalog.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::definition::loader::load_and_validate;
use crate::definition::model::Definition;
use crate::errors::{EngineError, Result};

/// Definitions available to snippet tasks, by name.
#[derive(Debug, Clone, Default)]
pub struct DefinitionCatalog {
    definitions: BTreeMap<String, Arc<Definition>>,
}

impl DefinitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` file of a directory.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut catalog = Self::new();
        for path in paths {
            debug!(path = %path.display(), "loading definition");
            catalog.insert(load_and_validate(&path)?)?;
        }
        info!(dir = %dir.display(), count = catalog.len(), "definition catalog loaded");
        Ok(catalog)
    }

    pub fn insert(&mut self, definition: Definition) -> Result<()> {
        if self.definitions.contains_key(&definition.name) {
            return Err(EngineError::ConfigError(format!(
                "definition '{}' registered twice",
                definition.name
            )));
        }
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn with(mut self, definition: Definition) -> Result<Self> {
        self.insert(definition)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Definition>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::structural(format!("unknown definition '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
