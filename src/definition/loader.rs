// src/definition/loader.rs

use std::fs;
use std::path::Path;

use crate::definition::model::{Definition, RawDefinition};
use crate::errors::Result;

/// Parse a definition without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawDefinition> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_raw(&contents)
}

pub fn parse_raw(contents: &str) -> Result<RawDefinition> {
    Ok(toml::from_str(contents)?)
}

/// Parse and validate a definition file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Definition> {
    Definition::try_from(load_from_path(path)?)
}

/// Parse and validate definition text.
pub fn parse_and_validate(contents: &str) -> Result<Definition> {
    Definition::try_from(parse_raw(contents)?)
}
