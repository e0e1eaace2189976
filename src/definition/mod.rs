// src/definition/mod.rs

//! Pipeline definitions: stages of tasks with predecessor links and
//! snippet references.
//!
//! - [`model`] is the TOML-backed data model.
//! - [`loader`] reads definitions from disk or text.
//! - [`validate`] checks names, references and acyclicity, and fills
//!   omitted `after` lists.
//! - [`catalog`] holds the definitions snippet tasks may run.

pub mod catalog;
pub mod loader;
pub mod model;
pub mod validate;

pub use catalog::DefinitionCatalog;
pub use loader::{load_and_validate, load_from_path, parse_and_validate};
pub use model::{
    Definition, LoopDef, OutputDef, RawDefinition, SNIPPET_EXECUTOR, SnippetDef, StageDef, TaskDef,
};
