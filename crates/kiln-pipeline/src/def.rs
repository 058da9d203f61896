// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Raw, already-decoded pipeline definitions.
//!
//! `spec.md` treats pipeline-file parsing as out of scope: callers hand this
//! crate a `PipelineDef` they decoded themselves (YAML/TOML/HCL/whatever).
//! This module only defines the object tree `resolve` consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountDef {
    pub host: String,
    pub container: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDef {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupDef {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheDef>,
    #[serde(default)]
    pub allow_network: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDef {
    pub step: String,
    #[serde(default)]
    pub copy_to_output: bool,
    #[serde(default)]
    pub optional: bool,
}

/// Kit invocation: `uses: "<name>"` plus arbitrary kit-specific params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KitUse {
    pub uses: String,
    #[serde(default)]
    pub with: BTreeMap<String, serde_json::Value>,
}

/// One step as written by the pipeline author, before kit expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDef {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub uses: Option<KitUse>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub setup: Option<SetupDef>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub env_file: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputDef>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub caches: Vec<CacheDef>,
    #[serde(default)]
    pub mounts: Vec<MountDef>,
    #[serde(default)]
    pub sources: Vec<MountDef>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,
}

/// A whole pipeline as written by the author, before resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub steps: Vec<StepDef>,
}

#[cfg(test)]
#[path = "def_tests.rs"]
mod tests;
