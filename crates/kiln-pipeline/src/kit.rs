// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Kit resolution: expand `uses:` shorthand into a concrete partial step.
//!
//! Precedence when resolving a kit name: (a) alias from project config,
//! (b) local kits directory, (c) builtin registry, (d) package specifier
//! (`@scope/name` or anything containing `/`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::model::{Cache, Mount};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KitError {
    #[error("unknown kit {name:?}")]
    UnknownKit { name: String },

    #[error("failed to load kit {name:?}: {message}")]
    KitLoadFailed { name: String, message: String },

    #[error("kit {name:?} does not export a callable resolver")]
    KitInvalidExport { name: String },

    #[error("kit {name:?} does not support param {param:?}")]
    UnsupportedParam { name: String, param: String },

    #[error("kit {name:?} params conflict on {param:?}")]
    ConflictingParam { name: String, param: String },

    #[error("kit {name:?} is missing required param {param:?}")]
    MissingParam { name: String, param: String },
}

/// The partial step a kit expands `uses:` into. User-supplied fields are
/// merged on top per `resolve`'s user-wins rules; `None`/empty fields are
/// simply not contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KitOutput {
    pub image: String,
    pub cmd: Vec<String>,
    pub setup_cmd: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub caches: Vec<Cache>,
    pub mounts: Vec<Mount>,
    pub sources: Vec<Mount>,
    pub allow_network: bool,
}

/// Context a kit resolver gets to do its own path/kit lookups.
pub struct KitContext<'a> {
    /// Directory the kit itself lives in (for resolving sibling assets).
    pub kit_dir: &'a Path,
    /// Allows a kit to resolve another kit by name (composition).
    pub resolve_kit: &'a dyn Fn(&str) -> Result<KitOutput, KitError>,
}

/// A kit: a named macro that expands parameters into a concrete step shape.
pub trait Kit: Send + Sync {
    fn resolve(&self, params: &BTreeMap<String, Value>, ctx: &KitContext<'_>)
        -> Result<KitOutput, KitError>;
}

impl<F> Kit for F
where
    F: Fn(&BTreeMap<String, Value>, &KitContext<'_>) -> Result<KitOutput, KitError> + Send + Sync,
{
    fn resolve(
        &self,
        params: &BTreeMap<String, Value>,
        ctx: &KitContext<'_>,
    ) -> Result<KitOutput, KitError> {
        self(params, ctx)
    }
}

/// An alias from project config: `name -> underlying kit name`.
#[derive(Debug, Clone, Default)]
pub struct KitAliases(pub BTreeMap<String, String>);

/// Resolves kit names to implementations, honoring the four-tier precedence.
pub struct KitRegistry {
    aliases: KitAliases,
    local_kits_dir: Option<PathBuf>,
    builtins: BTreeMap<String, Arc<dyn Kit>>,
}

impl KitRegistry {
    pub fn new(aliases: KitAliases, local_kits_dir: Option<PathBuf>) -> Self {
        Self {
            aliases,
            local_kits_dir,
            builtins: crate::builtin::builtin_kits(),
        }
    }

    pub fn with_builtin(mut self, name: impl Into<String>, kit: Arc<dyn Kit>) -> Self {
        self.builtins.insert(name.into(), kit);
        self
    }

    /// Resolve `name` and run it with `params`.
    pub fn resolve(
        &self,
        name: &str,
        params: &BTreeMap<String, Value>,
    ) -> Result<KitOutput, KitError> {
        // (a) alias
        let resolved_name = self
            .aliases
            .0
            .get(name)
            .map(String::as_str)
            .unwrap_or(name);

        // (b) local kits directory: <cwd>/kits/<name>/<entry> or <cwd>/kits/<name>.<ext>
        if let Some(dir) = &self.local_kits_dir {
            let as_dir = dir.join(resolved_name);
            let as_file_candidates = ["js", "ts", "json"].map(|ext| dir.join(format!("{resolved_name}.{ext}")));
            if as_dir.is_dir() || as_file_candidates.iter().any(|p| p.is_file()) {
                return Err(KitError::KitLoadFailed {
                    name: resolved_name.to_string(),
                    message: "external kit loading is not implemented in this reference engine"
                        .to_string(),
                });
            }
        }

        // (c) builtin registry
        if let Some(kit) = self.builtins.get(resolved_name) {
            let kit_dir = self
                .local_kits_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            let resolve_kit = |other: &str| -> Result<KitOutput, KitError> {
                Err(KitError::UnknownKit {
                    name: other.to_string(),
                })
            };
            let ctx = KitContext {
                kit_dir: &kit_dir,
                resolve_kit: &resolve_kit,
            };
            return kit.resolve(params, &ctx);
        }

        // (d) package specifier
        if resolved_name.contains('/') || resolved_name.starts_with('@') {
            return Err(KitError::KitLoadFailed {
                name: resolved_name.to_string(),
                message: "package-specifier kits require network access, not available here"
                    .to_string(),
            });
        }

        Err(KitError::UnknownKit {
            name: resolved_name.to_string(),
        })
    }
}

#[cfg(test)]
#[path = "kit_tests.rs"]
mod tests;
