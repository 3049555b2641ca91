// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact glob collection.
//!
//! A pattern without a path separator matches at any depth; patterns
//! containing `/` are taken literally. Matched files are copied into
//! `{artifact_root}/{job}/{build_number}/` with `/` in the relative path
//! flattened to `_`, and recorded with size, guessed content type, and a
//! SHA-256 digest.

use anyhow::{Context, Result};
use conveyor_core::ArtifactRecord;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Guess a content type from a file extension.
#[must_use]
pub fn guess_content_type(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "jar" => "application/java-archive",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Compile artifact patterns: bare names match at any depth, patterns with
/// `/` are literal. `*` stays within a segment, `**` crosses.
fn compile_patterns(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let effective = if pattern.contains('/') {
            pattern.clone()
        } else {
            format!("**/{pattern}")
        };
        let glob = GlobBuilder::new(&effective)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid artifact pattern: {pattern}"))?;
        builder.add(glob);
    }
    builder.build().context("compile artifact patterns")
}

/// Collect artifacts matching `patterns` out of `workspace`.
///
/// # Errors
///
/// Returns an error for invalid patterns or filesystem failures while
/// copying and hashing.
pub fn collect_artifacts(
    patterns: &[String],
    workspace: &Path,
    artifact_root: &Path,
    job: &str,
    build_number: u64,
) -> Result<Vec<ArtifactRecord>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let globs = compile_patterns(patterns)?;
    let dest_dir = artifact_root.join(job).join(build_number.to_string());
    let mut records = Vec::new();

    for entry in WalkDir::new(workspace).follow_links(false) {
        let entry = entry.with_context(|| format!("walk workspace {}", workspace.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .unwrap_or(entry.path());
        if !globs.is_match(rel) {
            continue;
        }

        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("create artifact dir {}", dest_dir.display()))?;
        let flat_name = rel.to_string_lossy().replace('/', "_");
        let dest = dest_dir.join(&flat_name);
        fs::copy(entry.path(), &dest)
            .with_context(|| format!("copy artifact {}", rel.display()))?;

        let bytes = fs::read(&dest)
            .with_context(|| format!("read artifact {}", dest.display()))?;
        let digest = Sha256::digest(&bytes);

        debug!(
            target: "conveyor.workspace",
            artifact = %flat_name,
            size = bytes.len() as u64,
            "artifact collected"
        );
        records.push(ArtifactRecord {
            file_name: flat_name,
            path: dest.display().to_string(),
            size: bytes.len() as u64,
            content_type: guess_content_type(&rel.to_string_lossy()).to_string(),
            sha256: format!("{digest:x}"),
        });
    }

    records.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(records)
}
