//! Run identity.
//!
//! A run is content-addressed: `run_id` is derived from the hashable config
//! envelope plus a deterministic hash of the staged source tree. Execution-
//! time facts (chosen worker, concrete paths, resolved devices) live in
//! `config_resolved` on the wire and never reach the hash.

use std::io;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use relay_protocol::canon::{self, CanonError};
use relay_protocol::CONTRACT_VERSION;

/// Glob patterns excluded from source-tree hashing by default.
pub const DEFAULT_EXCLUDES: &[&str] = &[".git/**", "target/**", "**/.DS_Store"];

/// Errors from identity computation.
///
/// Unstable input is refused here, before any job exists.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("hashing error: {0}")]
    Canon(#[from] CanonError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid exclude pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("source walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// One step of a run: the action name and the exact argv it resolves to.
/// Both are output-affecting and therefore hashable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInputs {
    pub action: String,
    pub argv: Vec<String>,
}

/// The hashable configuration envelope. Everything here drives `run_id`;
/// host-only operational settings must stay out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigInputs {
    /// Version of the config contract these inputs conform to.
    pub contract_version: u32,
    /// Ordered steps of the run.
    pub steps: Vec<StepInputs>,
}

impl ConfigInputs {
    /// A single-step run.
    pub fn single(action: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            contract_version: CONTRACT_VERSION,
            steps: vec![StepInputs {
                action: action.into(),
                argv,
            }],
        }
    }

    /// The JSON value handed to hashing and to the wire.
    pub fn to_value(&self) -> Result<serde_json::Value, IdentityError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// One file in the hashed source tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    /// SHA-256 of the file contents.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
}

/// Deterministic digest of a source tree.
#[derive(Debug, Clone)]
pub struct SourceTreeHash {
    /// SHA-256 over the JCS form of the sorted entry list.
    pub sha256: String,
    /// Number of hashed files.
    pub file_count: usize,
    /// Total hashed bytes.
    pub total_bytes: u64,
}

/// Hash a source tree: walk files under `root`, filter with exclude globs,
/// and digest the sorted `{path, sha256, size}` entry list.
pub fn hash_source_tree(root: &Path, excludes: &[String]) -> Result<SourceTreeHash, IdentityError> {
    let excludes = build_globset(excludes)?;

    let mut entries = Vec::new();
    let mut total_bytes = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let path = rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if excludes.is_match(&path) {
            continue;
        }

        let content = std::fs::read(entry.path())?;
        total_bytes += content.len() as u64;
        entries.push(TreeEntry {
            sha256: file_digest(&content),
            size: content.len() as u64,
            path,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let jcs = serde_json_canonicalizer::to_vec(&entries)
        .map_err(|e| IdentityError::Canon(CanonError::Jcs(e.to_string())))?;
    Ok(SourceTreeHash {
        sha256: file_digest(&jcs),
        file_count: entries.len(),
        total_bytes,
    })
}

fn file_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, IdentityError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// The derived identities of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// `sha256(JCS(config_inputs) || "\n" || source_tree_sha256)`.
    pub run_id: String,
    /// `sha256(JCS(config_inputs))`: cache key independent of source content.
    pub config_hash: String,
    /// Digest of the staged source tree.
    pub source_tree_sha256: String,
}

/// Compute the run identity, refusing unstable input.
pub fn compute_identity(
    inputs: &ConfigInputs,
    source_tree_sha256: &str,
) -> Result<RunIdentity, IdentityError> {
    let value = inputs.to_value()?;
    Ok(RunIdentity {
        run_id: canon::run_id(&value, source_tree_sha256)?,
        config_hash: canon::config_hash(&value)?,
        source_tree_sha256: source_tree_sha256.to_string(),
    })
}

/// Generate a globally unique, never-reused job identifier.
pub fn generate_job_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn default_excludes() -> Vec<String> {
        DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tree_hash_is_stable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta").unwrap();

        let first = hash_source_tree(dir.path(), &default_excludes()).unwrap();
        let second = hash_source_tree(dir.path(), &default_excludes()).unwrap();
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.file_count, 2);
    }

    #[test]
    fn test_tree_hash_changes_with_content() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let before = hash_source_tree(dir.path(), &default_excludes()).unwrap();

        std::fs::write(dir.path().join("a.txt"), "alphb").unwrap();
        let after = hash_source_tree(dir.path(), &default_excludes()).unwrap();
        assert_ne!(before.sha256, after.sha256);
    }

    #[test]
    fn test_tree_hash_honors_excludes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let before = hash_source_tree(dir.path(), &default_excludes()).unwrap();

        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "noise").unwrap();
        let after = hash_source_tree(dir.path(), &default_excludes()).unwrap();
        assert_eq!(before.sha256, after.sha256);
        assert_eq!(after.file_count, 1);
    }

    #[test]
    fn test_identity_differs_per_action() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let tree = hash_source_tree(dir.path(), &default_excludes()).unwrap();

        let build = compute_identity(&ConfigInputs::single("build", vec![]), &tree.sha256).unwrap();
        let test = compute_identity(&ConfigInputs::single("test", vec![]), &tree.sha256).unwrap();
        assert_ne!(build.run_id, test.run_id);
        assert_ne!(build.config_hash, test.config_hash);
        assert_eq!(build.source_tree_sha256, test.source_tree_sha256);
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = generate_job_id();
        let b = generate_job_id();
        assert_ne!(a, b);
        assert_eq!(a, a.to_lowercase());
    }
}
