// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Content-addressable fingerprinting for step cache keys.
//!
//! The fingerprint covers image, cmd, the setup cmd (not its env or caches —
//! those are mutable/shared state, not inputs that should bust the cache),
//! sorted env, sorted input run ids, and mounts sorted by container path.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::id::RunId;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to canonicalize value for fingerprinting: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// A step's cache key: lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The subset of a resolved step that feeds the fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    pub image: &'a str,
    pub cmd: &'a [String],
    pub setup_cmd: Option<&'a [String]>,
    pub env: &'a BTreeMap<String, String>,
    pub input_run_ids: &'a [RunId],
    pub mounts: &'a [MountRef<'a>],
}

#[derive(Debug, Clone)]
pub struct MountRef<'a> {
    pub container_path: &'a str,
    pub source: &'a str,
}

/// Canonical JSON serialization of a value: `serde_json` maps serialize
/// `BTreeMap`/struct fields in declared/sorted order already, so passing a
/// `BTreeMap` or a pre-sorted `Vec` guarantees a stable byte stream.
fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, FingerprintError> {
    Ok(serde_json::to_vec(value)?)
}

/// Compute the fingerprint for a step's inputs.
///
/// Hashing is streamed into a single SHA-256 digest rather than concatenating
/// strings first, so large mount/env lists don't require an intermediate
/// allocation proportional to their total size.
pub fn fingerprint(input: FingerprintInput<'_>) -> Result<Fingerprint, FingerprintError> {
    let mut hasher = Sha256::new();

    hasher.update(b"image\0");
    hasher.update(input.image.as_bytes());
    hasher.update(b"\0");

    hasher.update(b"cmd\0");
    hasher.update(canonical_json(input.cmd)?);
    hasher.update(b"\0");

    hasher.update(b"setup_cmd\0");
    if let Some(setup_cmd) = input.setup_cmd {
        hasher.update(canonical_json(setup_cmd)?);
    }
    hasher.update(b"\0");

    hasher.update(b"env\0");
    hasher.update(canonical_json(input.env)?);
    hasher.update(b"\0");

    hasher.update(b"inputs\0");
    let mut input_ids: Vec<&str> = input.input_run_ids.iter().map(RunId::as_str).collect();
    input_ids.sort_unstable();
    hasher.update(canonical_json(&input_ids)?);
    hasher.update(b"\0");

    hasher.update(b"mounts\0");
    let mut mounts: Vec<(&str, &str)> = input
        .mounts
        .iter()
        .map(|m| (m.container_path, m.source))
        .collect();
    mounts.sort_unstable_by_key(|(path, _)| *path);
    hasher.update(canonical_json(&mounts)?);

    let digest = hasher.finalize();
    Ok(Fingerprint(format!("{digest:x}")))
}

#[cfg(test)]
#[path = "fingerprint_tests.rs"]
mod tests;
