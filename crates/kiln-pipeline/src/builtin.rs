// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Built-in kits shipped with the engine: shell, node-like, python-like
//! shorthands for "run this script in a standard image".

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::kit::{Kit, KitContext, KitError, KitOutput};

fn string_param(
    kit_name: &str,
    params: &BTreeMap<String, Value>,
    key: &str,
) -> Result<Option<String>, KitError> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(KitError::UnsupportedParam {
            name: kit_name.to_string(),
            param: key.to_string(),
        }),
    }
}

fn require_string(
    kit_name: &str,
    params: &BTreeMap<String, Value>,
    key: &str,
) -> Result<String, KitError> {
    string_param(kit_name, params, key)?.ok_or_else(|| KitError::MissingParam {
        name: kit_name.to_string(),
        param: key.to_string(),
    })
}

fn reject_unknown_params(
    kit_name: &str,
    params: &BTreeMap<String, Value>,
    known: &[&str],
) -> Result<(), KitError> {
    for key in params.keys() {
        if !known.contains(&key.as_str()) {
            return Err(KitError::UnsupportedParam {
                name: kit_name.to_string(),
                param: key.clone(),
            });
        }
    }
    Ok(())
}

/// `uses: shell` with `with: { image?, script | run }` — runs a shell script
/// (or inline command) under `sh -c`.
fn shell_kit(params: &BTreeMap<String, Value>, _ctx: &KitContext<'_>) -> Result<KitOutput, KitError> {
    reject_unknown_params("shell", params, &["image", "script", "run"])?;
    let image = string_param("shell", params, "image")?.unwrap_or_else(|| "alpine:3.20".to_string());
    let script = string_param("shell", params, "script")?;
    let run = string_param("shell", params, "run")?;
    let command = match (script, run) {
        (Some(_), Some(_)) => {
            return Err(KitError::ConflictingParam {
                name: "shell".to_string(),
                param: "script/run".to_string(),
            })
        }
        (Some(script), None) => format!("sh {script}"),
        (None, Some(run)) => run,
        (None, None) => {
            return Err(KitError::MissingParam {
                name: "shell".to_string(),
                param: "script or run".to_string(),
            })
        }
    };
    Ok(KitOutput {
        image,
        cmd: vec!["sh".to_string(), "-c".to_string(), command],
        ..Default::default()
    })
}

/// `uses: node` with `with: { image?, script }` — `node <script>` on top of a
/// node base image, with a `node-modules` cache wired up.
fn node_kit(params: &BTreeMap<String, Value>, _ctx: &KitContext<'_>) -> Result<KitOutput, KitError> {
    reject_unknown_params("node", params, &["image", "script"])?;
    let image = string_param("node", params, "image")?.unwrap_or_else(|| "node:20-slim".to_string());
    let script = require_string("node", params, "script")?;
    Ok(KitOutput {
        image,
        cmd: vec!["node".to_string(), script],
        caches: vec![crate::model::Cache {
            name: "node-modules".to_string(),
            path: "/work/node_modules".to_string(),
            exclusive: false,
        }],
        ..Default::default()
    })
}

/// `uses: python` with `with: { image?, script, requirements? }` — `python
/// <script>`, optionally preceded by a `pip install -r` setup phase.
fn python_kit(
    params: &BTreeMap<String, Value>,
    _ctx: &KitContext<'_>,
) -> Result<KitOutput, KitError> {
    reject_unknown_params("python", params, &["image", "script", "requirements"])?;
    let image =
        string_param("python", params, "image")?.unwrap_or_else(|| "python:3.12-slim".to_string());
    let script = require_string("python", params, "script")?;
    let requirements = string_param("python", params, "requirements")?;

    Ok(KitOutput {
        image,
        cmd: vec!["python".to_string(), script],
        setup_cmd: requirements.map(|req| {
            vec![
                "pip".to_string(),
                "install".to_string(),
                "-r".to_string(),
                req,
            ]
        }),
        caches: vec![crate::model::Cache {
            name: "pip-cache".to_string(),
            path: "/root/.cache/pip".to_string(),
            exclusive: false,
        }],
        ..Default::default()
    })
}

pub fn builtin_kits() -> BTreeMap<String, Arc<dyn Kit>> {
    let mut kits: BTreeMap<String, Arc<dyn Kit>> = BTreeMap::new();
    kits.insert("shell".to_string(), Arc::new(shell_kit));
    kits.insert("node".to_string(), Arc::new(node_kit));
    kits.insert("python".to_string(), Arc::new(python_kit));
    kits
}

#[cfg(test)]
#[path = "builtin_tests.rs"]
mod tests;
