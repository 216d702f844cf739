//! Job workspace layout and path confinement.
//!
//! Every working path derives solely from the configured work root and the
//! job id. Host-supplied hints are honored only after validation: an
//! absolute hint must stay under the job root, and a relative hint must not
//! contain parent components.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use relay_protocol::request::JobPaths;

/// Marker file left behind when a workspace needs cleanup.
const CLEANUP_MARKER: &str = ".cleanup_pending";

/// Path confinement errors.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path '{hint}' escaped confinement")]
    OutOfBounds { hint: String },
}

/// The per-job directory layout, exclusively owned by one job.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    /// Job root: `<work_root>/jobs/<job_id>`.
    pub root: PathBuf,
    /// Staged source directory.
    pub source_dir: PathBuf,
    /// Backend scratch space.
    pub build_dir: PathBuf,
    /// Result bundle directory, committed at terminal state.
    pub artifact_dir: PathBuf,
}

impl JobWorkspace {
    /// Derive the workspace for a job, validating any host-supplied hints.
    pub fn resolve(work_root: &Path, job_id: &str, hints: &JobPaths) -> Result<Self, PathError> {
        let root = work_root.join("jobs").join(job_id);
        let source_dir = resolve_hint(&root, hints.source.as_deref(), "source")?;
        let artifact_dir = resolve_hint(&root, hints.artifacts.as_deref(), "artifacts")?;
        Ok(Self {
            build_dir: root.join("build"),
            source_dir,
            artifact_dir,
            root,
        })
    }

    /// Create all workspace directories.
    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.source_dir)?;
        fs::create_dir_all(&self.build_dir)?;
        fs::create_dir_all(&self.artifact_dir)?;
        Ok(())
    }

    /// Flag this workspace for later cleanup (session lost mid-run).
    pub fn mark_for_cleanup(&self) {
        let _ = fs::write(self.root.join(CLEANUP_MARKER), b"");
    }

    /// Whether the workspace is flagged for cleanup.
    pub fn cleanup_pending(&self) -> bool {
        self.root.join(CLEANUP_MARKER).exists()
    }
}

fn resolve_hint(root: &Path, hint: Option<&str>, default: &str) -> Result<PathBuf, PathError> {
    let hint = match hint {
        None => return Ok(root.join(default)),
        Some(hint) => hint,
    };

    let path = Path::new(hint);
    if path.is_absolute() {
        if path.starts_with(root) {
            return Ok(path.to_path_buf());
        }
        return Err(PathError::OutOfBounds {
            hint: hint.to_string(),
        });
    }

    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(PathError::OutOfBounds {
            hint: hint.to_string(),
        });
    }
    Ok(root.join(path))
}
