// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cache key template resolution.
//!
//! Templates are literal text with zero or more
//! `{{ hashFiles('<path>') }}` macros. Expansion reads the named
//! workspace-relative file, hashes it with SHA-256, and substitutes the
//! first 16 hex characters; a missing file substitutes the literal
//! `missing`.

use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;

/// Substituted when the hashed file does not exist.
const MISSING: &str = "missing";
/// How many hex characters of the digest land in the key.
const HASH_PREFIX_LEN: usize = 16;

/// Resolve a key template against a workspace.
#[must_use]
pub fn resolve_key(workspace: &Path, template: &str) -> String {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        resolved.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            // Unterminated macro: keep the remainder literally.
            resolved.push_str(&rest[open..]);
            return resolved;
        };
        let body = after_open[..close].trim();
        match parse_hash_files(body) {
            Some(path) => resolved.push_str(&hash_file(workspace, path)),
            None => {
                // Unknown macro: keep it literally, braces included.
                resolved.push_str("{{");
                resolved.push_str(&after_open[..close]);
                resolved.push_str("}}");
            }
        }
        rest = &after_open[close + 2..];
    }
    resolved.push_str(rest);
    resolved
}

/// Extract the quoted path from `hashFiles('<path>')`.
fn parse_hash_files(body: &str) -> Option<&str> {
    let args = body.strip_prefix("hashFiles")?.trim();
    let args = args.strip_prefix('(')?.strip_suffix(')')?.trim();
    args.strip_prefix('\'')?.strip_suffix('\'')
}

fn hash_file(workspace: &Path, relative: &str) -> String {
    let path = workspace.join(relative);
    match std::fs::read(&path) {
        Ok(bytes) => {
            let digest = Sha256::digest(&bytes);
            format!("{digest:x}")[..HASH_PREFIX_LEN].to_string()
        }
        Err(_) => {
            warn!(
                target: "conveyor.cache",
                path = %path.display(),
                "hashFiles target missing, substituting literal"
            );
            MISSING.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_templates_pass_through() {
        let ws = tempfile::tempdir().unwrap();
        assert_eq!(resolve_key(ws.path(), "deps-v1"), "deps-v1");
    }

    #[test]
    fn hash_files_substitutes_sixteen_hex_chars() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("lock"), "content").unwrap();
        let key = resolve_key(ws.path(), "deps-{{ hashFiles('lock') }}");
        let suffix = key.strip_prefix("deps-").unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_content_resolves_to_the_same_key() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("lock"), "pinned").unwrap();
        let a = resolve_key(ws.path(), "deps-{{ hashFiles('lock') }}");
        let b = resolve_key(ws.path(), "deps-{{ hashFiles('lock') }}");
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_changes_the_key() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("lock"), "v1").unwrap();
        let a = resolve_key(ws.path(), "deps-{{ hashFiles('lock') }}");
        std::fs::write(ws.path().join("lock"), "v2").unwrap();
        let b = resolve_key(ws.path(), "deps-{{ hashFiles('lock') }}");
        assert_ne!(a, b);
    }

    #[test]
    fn missing_file_substitutes_literal() {
        let ws = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_key(ws.path(), "deps-{{ hashFiles('absent.lock') }}"),
            "deps-missing"
        );
    }

    #[test]
    fn multiple_macros_resolve_independently() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("a"), "aa").unwrap();
        std::fs::write(ws.path().join("b"), "bb").unwrap();
        let key = resolve_key(ws.path(), "{{ hashFiles('a') }}-{{ hashFiles('b') }}");
        let parts: Vec<&str> = key.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert_ne!(parts[0], parts[1]);
    }

    #[test]
    fn unknown_macros_stay_literal() {
        let ws = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_key(ws.path(), "x-{{ version() }}"),
            "x-{{ version() }}"
        );
    }

    #[test]
    fn unterminated_macro_stays_literal() {
        let ws = tempfile::tempdir().unwrap();
        assert_eq!(resolve_key(ws.path(), "x-{{ hashFiles('a'"), "x-{{ hashFiles('a'");
    }
}
