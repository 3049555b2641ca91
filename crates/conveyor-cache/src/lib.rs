// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed artifact cache keyed by resolved key templates.
//!
//! Entries live at `{cache_root}/{job}/{key}` and are immutable once
//! written: the first writer for a key wins and later saves are no-ops.
//! Restore tries the exact key first, then each `restore-key` prefix
//! against the persisted entries for the job. Restored content is copied
//! file-by-file without following symlinks, so an entry cannot smuggle a
//! link that escapes the workspace.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Stage result cache fingerprinting.
pub mod fingerprint;
/// Cache key template resolution.
pub mod key;

pub use fingerprint::{CachedStageResult, ResultCache, StageFingerprint};
pub use key::resolve_key;

use chrono::{DateTime, Utc};
use conveyor_core::CacheDecl;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

// ---------------------------------------------------------------------------
// Index contract
// ---------------------------------------------------------------------------

/// Persisted metadata for one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Owning job.
    pub job: String,
    /// Resolved key.
    pub key: String,
    /// Cached workspace-relative paths, comma-joined.
    pub paths: String,
    /// Total size in bytes at save time.
    pub size: u64,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Persistence contract for cache entry metadata.
#[async_trait::async_trait]
pub trait CacheIndex: Send + Sync {
    /// Record a freshly written entry.
    async fn record_entry(&self, entry: &CacheEntry) -> anyhow::Result<()>;
    /// Entries for a job, newest first.
    async fn entries_for_job(&self, job: &str) -> anyhow::Result<Vec<CacheEntry>>;
    /// Remove an entry's metadata.
    async fn remove_entry(&self, job: &str, key: &str) -> anyhow::Result<()>;
}

/// Result of one restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// The key the declaration resolved to.
    pub requested_key: String,
    /// The key that actually satisfied the restore, when one did.
    pub effective_key: Option<String>,
}

impl RestoreOutcome {
    /// `true` when any entry satisfied the restore.
    #[must_use]
    pub fn hit(&self) -> bool {
        self.effective_key.is_some()
    }
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Directory-backed artifact cache.
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for one (job, key) entry.
    #[must_use]
    pub fn entry_dir(&self, job: &str, key: &str) -> PathBuf {
        self.root.join(job).join(key)
    }

    /// Restore each declaration into the workspace.
    ///
    /// The exact resolved key is tried first; on a miss, each restore-key
    /// prefix is matched against the index's entries for the job (newest
    /// first), taking the first whose directory still exists.
    ///
    /// # Errors
    ///
    /// Propagates index failures; filesystem problems inside an entry are
    /// logged and degrade to a miss.
    pub async fn restore(
        &self,
        workspace: &Path,
        job: &str,
        declarations: &[CacheDecl],
        index: &dyn CacheIndex,
    ) -> anyhow::Result<Vec<RestoreOutcome>> {
        let mut outcomes = Vec::new();
        for decl in declarations {
            let requested = resolve_key(workspace, &decl.key);
            let mut effective = None;

            let exact = self.entry_dir(job, &requested);
            if exact.is_dir() {
                copy_paths(&exact, workspace, &decl.paths);
                effective = Some(requested.clone());
            } else {
                'prefixes: for prefix in &decl.restore_keys {
                    for entry in index.entries_for_job(job).await? {
                        if entry.key.starts_with(prefix.as_str()) {
                            let dir = self.entry_dir(job, &entry.key);
                            if dir.is_dir() {
                                copy_paths(&dir, workspace, &decl.paths);
                                effective = Some(entry.key);
                                break 'prefixes;
                            }
                        }
                    }
                }
            }

            match &effective {
                Some(key) => info!(
                    target: "conveyor.cache",
                    job,
                    requested = %requested,
                    effective = %key,
                    "cache restored"
                ),
                None => debug!(target: "conveyor.cache", job, requested = %requested, "cache miss"),
            }
            outcomes.push(RestoreOutcome {
                requested_key: requested,
                effective_key: effective,
            });
        }
        Ok(outcomes)
    }

    /// Save each declaration whose resolved key is not already present.
    ///
    /// Entries are immutable: an existing directory wins and the save is a
    /// no-op for that key.
    ///
    /// # Errors
    ///
    /// Propagates index failures and entry-directory creation failures.
    pub async fn save(
        &self,
        workspace: &Path,
        job: &str,
        declarations: &[CacheDecl],
        index: &dyn CacheIndex,
    ) -> anyhow::Result<()> {
        for decl in declarations {
            let key = resolve_key(workspace, &decl.key);
            let dir = self.entry_dir(job, &key);
            if dir.exists() {
                debug!(target: "conveyor.cache", job, key = %key, "cache entry exists, save skipped");
                continue;
            }
            fs::create_dir_all(&dir)?;
            for path in &decl.paths {
                let src = workspace.join(path);
                if src.exists() {
                    copy_tree(&src, &dir.join(path));
                } else {
                    warn!(target: "conveyor.cache", job, path = %path, "cache path missing from workspace");
                }
            }
            let size = dir_size(&dir);
            index
                .record_entry(&CacheEntry {
                    job: job.to_string(),
                    key: key.clone(),
                    paths: decl.paths.join(","),
                    size,
                    created_at: Utc::now(),
                })
                .await?;
            info!(target: "conveyor.cache", job, key = %key, size, "cache entry saved");
        }
        Ok(())
    }

    /// Delete entries older than the retention window.
    ///
    /// # Errors
    ///
    /// Propagates index failures; directory removal failures are logged.
    pub async fn evict(
        &self,
        job: &str,
        retention_days: u32,
        index: &dyn CacheIndex,
    ) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut evicted = 0;
        for entry in index.entries_for_job(job).await? {
            if entry.created_at < cutoff {
                let dir = self.entry_dir(job, &entry.key);
                if dir.exists() {
                    if let Err(e) = fs::remove_dir_all(&dir) {
                        warn!(target: "conveyor.cache", key = %entry.key, error = %e, "failed to remove cache dir");
                    }
                }
                index.remove_entry(job, &entry.key).await?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(target: "conveyor.cache", job, evicted, "cache eviction complete");
        }
        Ok(evicted)
    }
}

/// Copy the declared paths from an entry directory back into the workspace.
fn copy_paths(entry_dir: &Path, workspace: &Path, paths: &[String]) {
    for path in paths {
        let src = entry_dir.join(path);
        if src.exists() {
            copy_tree(&src, &workspace.join(path));
        }
    }
}

/// Recursively copy regular files, never following symlinks.
fn copy_tree(src: &Path, dest: &Path) {
    for entry in WalkDir::new(src).follow_links(false) {
        let Ok(entry) = entry else { continue };
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = if rel.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(rel)
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            let _ = fs::create_dir_all(&target);
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(e) = fs::copy(entry.path(), &target) {
                warn!(target: "conveyor.cache", path = %entry.path().display(), error = %e, "copy failed");
            }
        } else {
            // Symlinks and specials are skipped so cached content cannot
            // point outside the workspace.
            warn!(target: "conveyor.cache", path = %entry.path().display(), "skipping non-regular file");
        }
    }
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
