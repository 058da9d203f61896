// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Resolve(def, root, kit_ctx) -> Pipeline`: decode a definition tree into a
//! validated, kit-expanded, graph-checked [`Pipeline`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_core::{build_graph, validate_graph, CyclicDependencyError, StepId};
use thiserror::Error;

use crate::def::{PipelineDef, StepDef};
use crate::kit::{KitError, KitOutput, KitRegistry};
use crate::model::{
    Cache, Input, Mount, Pipeline, Setup, Step, DEFAULT_OUTPUT_PATH, DEFAULT_RETRY_DELAY_MS,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("pipeline must declare an id or displayName")]
    MissingIdentity,

    #[error("steps must be a non-empty sequence")]
    EmptySteps,

    #[error("duplicate step id {id:?}")]
    DuplicateStepId { id: String },

    #[error("step {step:?} references unknown step {referenced:?}")]
    UnknownStepReference { step: String, referenced: String },

    #[error(transparent)]
    Field(#[from] kiln_core::ValidationError),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{location}: {source}")]
    Validation {
        location: String,
        #[source]
        source: ValidationError,
    },

    #[error("{location}: {source}")]
    Kit {
        location: String,
        #[source]
        source: KitError,
    },

    #[error(transparent)]
    Cyclic(#[from] CyclicDependencyError),
}

impl ResolveError {
    fn validation(location: impl Into<String>, source: impl Into<ValidationError>) -> Self {
        Self::Validation {
            location: location.into(),
            source: source.into(),
        }
    }

    fn kit(location: impl Into<String>, source: KitError) -> Self {
        Self::Kit {
            location: location.into(),
            source,
        }
    }
}

/// Slugify a display name into a pipeline id: lowercase, transliterate
/// common accented letters, replace non-`[A-Za-z0-9_-]` runs with a single
/// `-`, trim leading/trailing `-`.
pub fn slugify_display_name(display_name: &str) -> String {
    let transliterated: String = display_name.chars().map(transliterate).collect();
    let lower = transliterated.to_lowercase();

    let mut slug = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

fn transliterate(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'a',
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => 'i',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => 'u',
        'ñ' | 'Ñ' => 'n',
        'ç' | 'Ç' => 'c',
        'ý' | 'ÿ' | 'Ý' => 'y',
        other => other,
    }
}

/// Merge a kit's partial output with the user's own step fields. Env and
/// caches are merged key/name-wise with user values winning; mounts and
/// sources concatenate with kit entries first.
fn merge_kit_output(kit_output: KitOutput, step_def: &StepDef) -> (String, Vec<String>, Option<Vec<String>>, BTreeMap<String, String>, Vec<Cache>, Vec<Mount>, Vec<Mount>, bool) {
    let image = step_def.image.clone().unwrap_or(kit_output.image);
    let cmd = step_def.cmd.clone().unwrap_or(kit_output.cmd);
    let setup_cmd = step_def
        .setup
        .as_ref()
        .map(|s| s.cmd.clone())
        .or(kit_output.setup_cmd);

    let mut env: BTreeMap<String, String> = kit_output.env;
    for (k, v) in &step_def.env {
        env.insert(k.clone(), v.clone());
    }

    let mut caches_by_name: BTreeMap<String, Cache> = kit_output
        .caches
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect();
    for cache_def in &step_def.caches {
        caches_by_name.insert(
            cache_def.name.clone(),
            Cache {
                name: cache_def.name.clone(),
                path: cache_def.path.clone(),
                exclusive: cache_def.exclusive,
            },
        );
    }
    let caches: Vec<Cache> = caches_by_name.into_values().collect();

    let mut mounts: Vec<Mount> = kit_output.mounts;
    mounts.extend(step_def.mounts.iter().map(|m| Mount {
        host: m.host.clone(),
        container: m.container.clone(),
    }));

    let mut sources: Vec<Mount> = kit_output.sources;
    sources.extend(step_def.sources.iter().map(|m| Mount {
        host: m.host.clone(),
        container: m.container.clone(),
    }));

    let allow_network = step_def.allow_network || kit_output.allow_network;

    (image, cmd, setup_cmd, env, caches, mounts, sources, allow_network)
}

/// Rewrite a kit-produced absolute host path to be pipeline-root-relative
/// when it falls under `root`, so a bundled pipeline stays portable.
/// User-declared hosts are never touched by this (they're always already
/// relative by the time this runs — only kit output can be absolute).
fn normalize_kit_host(host: String, root: &Path) -> String {
    let path = Path::new(&host);
    if path.is_absolute() {
        if let Ok(relative) = path.strip_prefix(root) {
            return relative.to_string_lossy().into_owned();
        }
    }
    host
}

/// Decode a definition tree into a fully-resolved, validated [`Pipeline`].
pub fn resolve(
    def: &PipelineDef,
    root: &Path,
    cwd: &Path,
    kits: &KitRegistry,
) -> Result<Pipeline, ResolveError> {
    let id = match (&def.id, &def.display_name) {
        (Some(id), _) => id.clone(),
        (None, Some(name)) => slugify_display_name(name),
        (None, None) => {
            return Err(ResolveError::validation("id", ValidationError::MissingIdentity))
        }
    };

    if def.steps.is_empty() {
        return Err(ResolveError::validation("steps", ValidationError::EmptySteps));
    }

    let mut resolved_steps: Vec<Step> = Vec::with_capacity(def.steps.len());
    let mut seen_ids: BTreeMap<String, ()> = BTreeMap::new();

    for step_def in &def.steps {
        let location = format!("steps.{}", step_def.id);

        kiln_core::validate_slug("steps[].id", &step_def.id)
            .map_err(|e| ResolveError::validation(&location, e))?;

        if seen_ids.insert(step_def.id.clone(), ()).is_some() {
            return Err(ResolveError::validation(
                &location,
                ValidationError::DuplicateStepId {
                    id: step_def.id.clone(),
                },
            ));
        }

        let kit_output = match &step_def.uses {
            Some(kit_use) => kits
                .resolve(&kit_use.uses, &kit_use.with)
                .map_err(|e| ResolveError::kit(&location, e))?,
            None => KitOutput::default(),
        };

        let (image, cmd, setup_cmd, env, mut caches, mut mounts, mut sources, allow_network) =
            merge_kit_output(kit_output, step_def);

        for mount in mounts.iter_mut().chain(sources.iter_mut()) {
            mount.host = normalize_kit_host(std::mem::take(&mut mount.host), root);
        }

        if image.is_empty() {
            return Err(ResolveError::validation(
                format!("{location}.image"),
                kiln_core::ValidationError::Empty {
                    field: "image".to_string(),
                },
            ));
        }
        if cmd.is_empty() {
            return Err(ResolveError::validation(
                format!("{location}.cmd"),
                kiln_core::ValidationError::Empty {
                    field: "cmd".to_string(),
                },
            ));
        }

        for (i, mount) in mounts.iter().enumerate() {
            kiln_core::validate_mount_host(
                &format!("{location}.mounts[{i}].host"),
                &mount.host,
                root,
                cwd,
            )
            .map_err(|e| ResolveError::validation(format!("{location}.mounts[{i}].host"), e))?;
            kiln_core::validate_absolute_no_traversal(
                &format!("{location}.mounts[{i}].container"),
                &mount.container,
            )
            .map_err(|e| {
                ResolveError::validation(format!("{location}.mounts[{i}].container"), e)
            })?;
        }
        for (i, source) in sources.iter().enumerate() {
            kiln_core::validate_mount_host(
                &format!("{location}.sources[{i}].host"),
                &source.host,
                root,
                cwd,
            )
            .map_err(|e| ResolveError::validation(format!("{location}.sources[{i}].host"), e))?;
            kiln_core::validate_absolute_no_traversal(
                &format!("{location}.sources[{i}].container"),
                &source.container,
            )
            .map_err(|e| {
                ResolveError::validation(format!("{location}.sources[{i}].container"), e)
            })?;
        }
        for (i, cache) in caches.iter().enumerate() {
            kiln_core::validate_slug(&format!("{location}.caches[{i}].name"), &cache.name)
                .map_err(|e| ResolveError::validation(format!("{location}.caches[{i}].name"), e))?;
            kiln_core::validate_cache_path(&format!("{location}.caches[{i}].path"), &cache.path)
                .map_err(|e| ResolveError::validation(format!("{location}.caches[{i}].path"), e))?;
        }
        caches.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(cmd) = &setup_cmd {
            if cmd.is_empty() {
                return Err(ResolveError::validation(
                    format!("{location}.setup.cmd"),
                    kiln_core::ValidationError::Empty {
                        field: "setup.cmd".to_string(),
                    },
                ));
            }
        }

        let setup = setup_cmd.map(|cmd| Setup {
            cmd,
            caches: step_def
                .setup
                .as_ref()
                .map(|s| {
                    s.caches
                        .iter()
                        .map(|c| Cache {
                            name: c.name.clone(),
                            path: c.path.clone(),
                            exclusive: c.exclusive,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            allow_network: step_def
                .setup
                .as_ref()
                .map(|s| s.allow_network)
                .unwrap_or(false),
        });

        let inputs: Vec<Input> = step_def
            .inputs
            .iter()
            .map(|i| Input {
                step: StepId::new(i.step.clone()),
                copy_to_output: i.copy_to_output,
                optional: i.optional,
            })
            .collect();

        let output_path = step_def
            .output_path
            .clone()
            .unwrap_or_else(|| DEFAULT_OUTPUT_PATH.to_string());
        kiln_core::validate_absolute_no_traversal(&format!("{location}.outputPath"), &output_path)
            .map_err(|e| ResolveError::validation(format!("{location}.outputPath"), e))?;

        resolved_steps.push(Step {
            id: StepId::new(step_def.id.clone()),
            display_name: step_def.display_name.clone(),
            image,
            cmd,
            setup,
            env,
            env_file: step_def.env_file.clone().map(PathBuf::from),
            inputs,
            output_path,
            caches,
            mounts,
            sources,
            timeout_sec: step_def.timeout_sec,
            allow_failure: step_def.allow_failure,
            allow_network,
            retries: step_def.retries.unwrap_or(0),
            retry_delay_ms: step_def.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            if_condition: step_def.if_condition.clone(),
        });
    }

    let known_ids: std::collections::HashSet<&str> =
        resolved_steps.iter().map(|s| s.id.as_str()).collect();
    for step in &resolved_steps {
        for input in step.non_optional_inputs() {
            if !known_ids.contains(input.step.as_str()) {
                return Err(ResolveError::validation(
                    format!("steps.{}.inputs", step.id),
                    ValidationError::UnknownStepReference {
                        step: step.id.as_str().to_string(),
                        referenced: input.step.as_str().to_string(),
                    },
                ));
            }
        }
    }

    let edges = resolved_steps.iter().map(|s| {
        let deps = s
            .inputs
            .iter()
            .filter(|i| known_ids.contains(i.step.as_str()))
            .map(|i| i.step.clone());
        (s.id.clone(), deps)
    });
    let graph = build_graph(edges);
    validate_graph(&graph)?;

    Ok(Pipeline {
        id,
        display_name: def.display_name.clone(),
        root: root.to_path_buf(),
        steps: resolved_steps,
    })
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
