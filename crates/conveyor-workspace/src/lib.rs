// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-build workspace directories and artifact collection.
//!
//! Workspaces live under `{root}/{job}/{build-number}`. Every resolved path
//! is checked against the canonical root; anything escaping it is rejected
//! before any filesystem action happens.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Artifact glob collection.
pub mod artifacts;

pub use artifacts::{collect_artifacts, guess_content_type};

use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from workspace path management.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A resolved path escaped the workspace root.
    #[error("path '{path}' escapes the workspace root '{root}'")]
    Traversal {
        /// The offending path.
        path: String,
        /// The canonical root it escaped.
        root: String,
    },

    /// Filesystem failure while creating or resolving directories.
    #[error("workspace io failure at '{path}'")]
    Io {
        /// The path involved.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Creates and vouches for per-build workspace directories.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`, creating and canonicalizing it.
    ///
    /// # Errors
    ///
    /// Returns an error when the root cannot be created or canonicalized.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        let root = root.canonicalize().map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    /// The canonical workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or reuse) the directory for one build.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Traversal`] when the job name smuggles the
    /// path outside the root, or an io error from directory creation.
    pub fn build_dir(&self, job: &str, build_number: u64) -> Result<PathBuf, WorkspaceError> {
        let dir = self.root.join(job).join(build_number.to_string());
        // Reject traversal before touching the filesystem.
        reject_escaping_components(&dir, &self.root)?;
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let canonical = dir.canonicalize().map_err(|e| io_err(&dir, e))?;
        if !canonical.starts_with(&self.root) {
            return Err(WorkspaceError::Traversal {
                path: canonical.display().to_string(),
                root: self.root.display().to_string(),
            });
        }
        debug!(target: "conveyor.workspace", dir = %canonical.display(), "workspace ready");
        Ok(canonical)
    }

    /// Resolve a workspace-relative path, rejecting escapes.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Traversal`] for absolute paths and any
    /// `..` traversal out of `workspace`.
    pub fn resolve_in(workspace: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            return Err(WorkspaceError::Traversal {
                path: relative.to_string(),
                root: workspace.display().to_string(),
            });
        }
        let joined = workspace.join(candidate);
        reject_escaping_components(&joined, workspace)?;
        Ok(joined)
    }
}

/// Lexically verify that `path` stays under `root` (no net `..` escape).
fn reject_escaping_components(path: &Path, root: &Path) -> Result<(), WorkspaceError> {
    let rel = path.strip_prefix(root).map_err(|_| WorkspaceError::Traversal {
        path: path.display().to_string(),
        root: root.display().to_string(),
    })?;
    let mut depth: i64 = 0;
    for component in rel.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(WorkspaceError::Traversal {
                        path: path.display().to_string(),
                        root: root.display().to_string(),
                    });
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(WorkspaceError::Traversal {
                    path: path.display().to_string(),
                    root: root.display().to_string(),
                });
            }
        }
    }
    Ok(())
}
