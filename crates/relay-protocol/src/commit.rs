//! Two-phase artifact commit protocol.
//!
//! 1. Job outputs land at their final relative paths while the job is
//!    non-terminal (append-only; a live status file may be atomically
//!    replaced).
//! 2. At terminal state, `manifest.json` enumerates every file with its
//!    hash and size.
//! 3. `job_index.json` is written LAST via atomic rename.
//!
//! Consumers treat the presence of `job_index.json` as the single signal
//! that the artifact set is complete and internally consistent. Files
//! without the marker mean "not yet ready", never "ready but partial".

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canon;
use crate::event::JobOutcome;

/// Schema version for manifest.json.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for manifest.json.
pub const MANIFEST_SCHEMA_ID: &str = "relay/manifest@1";

/// Schema version for job_index.json.
pub const JOB_INDEX_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for job_index.json.
pub const JOB_INDEX_SCHEMA_ID: &str = "relay/job_index@1";

/// Manifest file name.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Terminal index marker file name; its presence commits the set.
pub const MARKER_FILE: &str = "job_index.json";

/// Files excluded from manifest entries.
pub const EXCLUDED_FILES: &[&str] = &[MANIFEST_FILE, MARKER_FILE];

/// Errors from artifact commit operations.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    Jcs(String),

    #[error("artifact set at {0:?} is not committed (no index marker)")]
    NotCommitted(PathBuf),

    #[error("manifest entry {path} failed verification: {reason}")]
    EntryMismatch { path: String, reason: String },

    #[error("file {0} present in artifact directory but absent from manifest")]
    UnmanifestedFile(String),
}

/// Result type for artifact commit operations.
pub type CommitResult<T> = Result<T, CommitError>;

/// Entry in the artifact manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative path within the artifact directory.
    pub path: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// SHA-256 of file contents (absent for directories).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Entry type ("file" or "directory").
    #[serde(rename = "type")]
    pub entry_type: String,
}

/// The manifest enumerating a committed artifact set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    pub job_id: String,
    pub attempt: u32,
    /// Entries sorted by path.
    pub entries: Vec<ManifestEntry>,
    /// SHA-256 of the JCS form of `entries`.
    pub artifact_root_sha256: String,
}

/// The terminal index marker, written last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIndex {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    pub job_id: String,
    pub attempt: u32,
    /// Terminal outcome of the job this set belongs to.
    pub state: JobOutcome,
    /// SHA-256 of the manifest bytes as written.
    pub manifest_sha256: String,
}

/// Identity fields stamped into the manifest and index.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub run_id: String,
    pub job_id: String,
    pub attempt: u32,
    pub outcome: JobOutcome,
}

/// Write bytes to `dir/filename` via write-then-rename.
///
/// This is the one atomic-replace primitive of the protocol, also used for
/// the live status file during execution.
pub fn atomic_write(dir: &Path, filename: &str, content: &[u8]) -> CommitResult<()> {
    let final_path = dir.join(filename);
    let temp_path = dir.join(format!(".{}.tmp", filename));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, &final_path)?;
    Ok(())
}

/// Check if an artifact directory is committed (marker present).
pub fn is_committed(artifact_dir: &Path) -> bool {
    artifact_dir.join(MARKER_FILE).exists()
}

/// Artifact committer: runs the manifest-then-marker phases once the job
/// producing the directory has reached a terminal state.
pub struct ArtifactCommitter;

impl ArtifactCommitter {
    /// Commit the artifact set.
    ///
    /// Always regenerates the manifest from the directory contents; hashes
    /// are never copied forward from a previous commit.
    pub fn commit(artifact_dir: &Path, identity: &CommitIdentity) -> CommitResult<Manifest> {
        let entries = Self::collect_entries(artifact_dir)?;
        let artifact_root_sha256 = Self::root_hash(&entries)?;

        let manifest = Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            schema_id: MANIFEST_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            run_id: identity.run_id.clone(),
            job_id: identity.job_id.clone(),
            attempt: identity.attempt,
            entries,
            artifact_root_sha256,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        atomic_write(artifact_dir, MANIFEST_FILE, manifest_json.as_bytes())?;

        let index = JobIndex {
            schema_version: JOB_INDEX_SCHEMA_VERSION,
            schema_id: JOB_INDEX_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            run_id: identity.run_id.clone(),
            job_id: identity.job_id.clone(),
            attempt: identity.attempt,
            state: identity.outcome,
            manifest_sha256: canon::sha256_hex(manifest_json.as_bytes()),
        };
        let index_json = serde_json::to_string_pretty(&index)?;
        atomic_write(artifact_dir, MARKER_FILE, index_json.as_bytes())?;

        Ok(manifest)
    }

    /// Collect manifest entries, sorted by path, excluding the commit files.
    fn collect_entries(artifact_dir: &Path) -> CommitResult<Vec<ManifestEntry>> {
        let mut entries = Vec::new();
        Self::walk_dir(artifact_dir, artifact_dir, &mut entries)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn walk_dir(root: &Path, current: &Path, entries: &mut Vec<ManifestEntry>) -> CommitResult<()> {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            let rel_path = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
            let rel_path_str = rel_path.to_string_lossy().to_string();

            if EXCLUDED_FILES.contains(&rel_path_str.as_str()) {
                continue;
            }
            // Leftovers from an interrupted atomic_write are not artifacts.
            if rel_path_str.starts_with('.') && rel_path_str.ends_with(".tmp") {
                continue;
            }

            if file_type.is_dir() {
                entries.push(ManifestEntry {
                    path: rel_path_str,
                    size: 0,
                    sha256: None,
                    entry_type: "directory".to_string(),
                });
                Self::walk_dir(root, &path, entries)?;
            } else if file_type.is_file() {
                let content = fs::read(&path)?;
                entries.push(ManifestEntry {
                    path: rel_path_str,
                    size: content.len() as u64,
                    sha256: Some(canon::sha256_hex(&content)),
                    entry_type: "file".to_string(),
                });
            }
            // Symlinks and other file types are skipped.
        }
        Ok(())
    }

    /// Compute artifact_root_sha256 over the JCS form of the entry list.
    fn root_hash(entries: &[ManifestEntry]) -> CommitResult<String> {
        let jcs = serde_json_canonicalizer::to_vec(&entries.to_vec())
            .map_err(|e| CommitError::Jcs(e.to_string()))?;
        Ok(canon::sha256_hex(&jcs))
    }
}

/// Verify a committed artifact set.
///
/// Requires the marker, re-reads the manifest, recomputes every file hash,
/// and rejects files present on disk but absent from the manifest. Returns
/// the parsed manifest on success.
pub fn verify(artifact_dir: &Path) -> CommitResult<Manifest> {
    if !is_committed(artifact_dir) {
        return Err(CommitError::NotCommitted(artifact_dir.to_path_buf()));
    }

    let manifest_bytes = fs::read(artifact_dir.join(MANIFEST_FILE))?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

    let index_bytes = fs::read(artifact_dir.join(MARKER_FILE))?;
    let index: JobIndex = serde_json::from_slice(&index_bytes)?;
    if index.manifest_sha256 != canon::sha256_hex(&manifest_bytes) {
        return Err(CommitError::EntryMismatch {
            path: MANIFEST_FILE.to_string(),
            reason: "manifest digest does not match index".to_string(),
        });
    }

    for entry in &manifest.entries {
        let path = artifact_dir.join(&entry.path);
        if entry.entry_type == "directory" {
            if !path.is_dir() {
                return Err(CommitError::EntryMismatch {
                    path: entry.path.clone(),
                    reason: "directory missing".to_string(),
                });
            }
            continue;
        }
        let content = fs::read(&path).map_err(|_| CommitError::EntryMismatch {
            path: entry.path.clone(),
            reason: "file missing".to_string(),
        })?;
        if content.len() as u64 != entry.size {
            return Err(CommitError::EntryMismatch {
                path: entry.path.clone(),
                reason: format!("size {} != manifest {}", content.len(), entry.size),
            });
        }
        if entry.sha256.as_deref() != Some(canon::sha256_hex(&content).as_str()) {
            return Err(CommitError::EntryMismatch {
                path: entry.path.clone(),
                reason: "content hash mismatch".to_string(),
            });
        }
    }

    let actual = ArtifactCommitter::collect_entries(artifact_dir)?;
    for entry in &actual {
        if !manifest.entries.iter().any(|m| m.path == entry.path) {
            return Err(CommitError::UnmanifestedFile(entry.path.clone()));
        }
    }

    Ok(manifest)
}
