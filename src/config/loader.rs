// src/config/loader.rs

use std::fs;
use std::path::Path;

use crate::config::model::{EngineConfig, RawEngineConfig};
use crate::errors::Result;

/// Load an engine configuration file and return the raw `RawEngineConfig`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawEngineConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: RawEngineConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Load an engine configuration file and validate it.
///
/// A missing path yields the defaults.
pub fn load_and_validate(path: Option<&Path>) -> Result<EngineConfig> {
    let raw = match path {
        Some(path) => load_from_path(path)?,
        None => RawEngineConfig::default(),
    };
    EngineConfig::try_from(raw)
}
