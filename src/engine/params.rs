// src/engine/params.rs

//! Reference substitution for run parameters, commands and outputs.
//!
//! Supported forms:
//! - `${alias:OUTPUT:key}` and `${{ outputs.alias.key }}`: output `key` of
//!   task `alias`.
//! - `${params.key}` and `${{ params.key }}`: run parameter `key`.
//!
//! Anything else, including plain shell `${VAR}`, is left untouched.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::errors::{EngineError, Result};
use crate::model::Task;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\$\{\{\s*outputs\.(?P<oa>[A-Za-z0-9_\-]+)\.(?P<ok>[A-Za-z0-9_.\-]+)\s*\}\}",
        r"|\$\{(?P<la>[A-Za-z0-9_\-]+):OUTPUT:(?P<lk>[A-Za-z0-9_.\-]+)\}",
        r"|\$\{\{\s*params\.(?P<bp>[A-Za-z0-9_.\-]+)\s*\}\}",
        r"|\$\{params\.(?P<sp>[A-Za-z0-9_.\-]+)\}",
    ))
    .expect("valid reference regex")
});

enum Reference<'a> {
    Output { alias: &'a str, key: &'a str },
    Param(&'a str),
}

fn classify<'a>(caps: &Captures<'a>) -> Option<Reference<'a>> {
    let group = |name| caps.name(name).map(|m| m.as_str());
    if let (Some(alias), Some(key)) = (group("oa"), group("ok")) {
        return Some(Reference::Output { alias, key });
    }
    if let (Some(alias), Some(key)) = (group("la"), group("lk")) {
        return Some(Reference::Output { alias, key });
    }
    group("bp").or(group("sp")).map(Reference::Param)
}

/// Substitute every reference in `template`.
///
/// `outputs` is keyed `alias.key` (see [`flatten_outputs`]). A reference
/// that cannot be resolved is a user error.
pub fn resolve(
    template: &str,
    outputs: &BTreeMap<String, String>,
    params: &BTreeMap<String, String>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in REFERENCE.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        let value = match classify(&caps) {
            Some(Reference::Output { alias, key }) => outputs.get(&format!("{alias}.{key}")),
            Some(Reference::Param(key)) => params.get(key),
            None => None,
        };
        let value = value.ok_or_else(|| {
            EngineError::User(format!("unresolved reference '{}'", whole.as_str()))
        })?;
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Resolve every value of a parameter map.
pub fn resolve_map(
    values: &BTreeMap<String, String>,
    outputs: &BTreeMap<String, String>,
    params: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve(v, outputs, params)?)))
        .collect()
}

/// Task aliases referenced through output references in `template`.
pub fn output_aliases(template: &str) -> Vec<String> {
    REFERENCE
        .captures_iter(template)
        .filter_map(|caps| match classify(&caps) {
            Some(Reference::Output { alias, .. }) => Some(alias.to_string()),
            _ => None,
        })
        .collect()
}

/// Result metadata of every task, keyed `task.key`.
pub fn flatten_outputs<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for task in tasks {
        for (key, value) in &task.result.metadata {
            out.insert(format!("{}.{}", task.name, key), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_every_reference_form() {
        let outputs = BTreeMap::from([("build.version".to_string(), "1.2".to_string())]);
        let params = BTreeMap::from([("env".to_string(), "prod".to_string())]);

        let got = resolve(
            "${build:OUTPUT:version}/${{ outputs.build.version }}/${params.env}/${{params.env}}/$HOME/${PATH}",
            &outputs,
            &params,
        )
        .unwrap();
        assert_eq!(got, "1.2/1.2/prod/prod/$HOME/${PATH}");
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let empty = BTreeMap::new();
        let err = resolve("${{ outputs.a.b }}", &empty, &empty).unwrap_err();
        assert!(err.is_user());
        assert_eq!(output_aliases("${a:OUTPUT:x} ${{ outputs.b.y }} ${params.z}"), vec!["a", "b"]);
    }
}
