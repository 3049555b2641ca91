// SPDX-License-Identifier: MIT OR Apache-2.0
//! Container invocation construction for container steps.
//!
//! The engine wraps container steps into a `docker run` command line
//! executed through the process collaborator. Every interpolated value is
//! shell-quoted; volume names and mount paths are validated before they
//! reach the command line; environment is injected by name only, so secret
//! values never appear in the invocation text.

use conveyor_core::{ContainerSpec, PullPolicy, is_valid_image_ref};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors constructing a container invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    /// Empty or malformed image reference.
    #[error("invalid container image: '{0}'")]
    InvalidImage(String),

    /// A volume entry is not `name:/absolute/path`.
    #[error("invalid volume declaration: '{0}'")]
    InvalidVolume(String),

    /// A volume name contains characters outside the safe set.
    #[error("invalid volume name: '{0}'")]
    InvalidVolumeName(String),

    /// A mount path is relative or contains `..`.
    #[error("invalid mount path: '{0}'")]
    InvalidMountPath(String),
}

/// Quote a value for `sh`, wrapping in single quotes and escaping embedded
/// quotes.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_safe_volume_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_safe_mount_path(path: &str) -> bool {
    path.starts_with('/') && !path.split('/').any(|seg| seg == "..")
}

/// Build the full `docker run` command line for a container step.
///
/// The workspace is always bind-mounted at the working directory and the
/// merged environment is attached by name (`-e KEY`), values travelling
/// through the process environment instead of the command line.
///
/// # Errors
///
/// Returns a [`ContainerError`] when the image, a volume name, or a mount
/// path fails validation.
pub fn build_invocation(
    spec: &ContainerSpec,
    command: Option<&str>,
    workspace: &Path,
    env: &BTreeMap<String, String>,
) -> Result<String, ContainerError> {
    if !is_valid_image_ref(&spec.image) {
        return Err(ContainerError::InvalidImage(spec.image.clone()));
    }

    let working_dir = spec.working_dir.as_deref().unwrap_or("/workspace");
    if !is_safe_mount_path(working_dir) {
        return Err(ContainerError::InvalidMountPath(working_dir.to_string()));
    }

    let mut args: Vec<String> = vec!["docker".into(), "run".into(), "--rm".into()];

    args.push("-v".into());
    args.push(shell_quote(&format!(
        "{}:{}",
        workspace.display(),
        working_dir
    )));
    args.push("-w".into());
    args.push(shell_quote(working_dir));

    for volume in &spec.volumes {
        let Some((name, mount)) = volume.split_once(':') else {
            return Err(ContainerError::InvalidVolume(volume.clone()));
        };
        if !is_safe_volume_name(name) {
            return Err(ContainerError::InvalidVolumeName(name.to_string()));
        }
        if !is_safe_mount_path(mount) {
            return Err(ContainerError::InvalidMountPath(mount.to_string()));
        }
        args.push("-v".into());
        args.push(shell_quote(&format!("{name}:{mount}")));
    }

    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(shell_quote(network));
    }

    args.push(match spec.pull_policy {
        PullPolicy::Always => "--pull=always".into(),
        PullPolicy::IfNotPresent => "--pull=missing".into(),
        PullPolicy::Never => "--pull=never".into(),
    });

    // Env by name only; the value rides in the process environment.
    for key in env.keys() {
        args.push("-e".into());
        args.push(shell_quote(key));
    }

    for extra in &spec.extra_args {
        args.push(shell_quote(extra));
    }

    args.push(shell_quote(&spec.image));

    if let Some(command) = command {
        args.push("sh".into());
        args.push("-c".into());
        args.push(shell_quote(command));
    }

    Ok(args.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn basic_invocation_mounts_workspace() {
        let spec = ContainerSpec::image("rust:1.85");
        let cmd = build_invocation(&spec, Some("cargo test"), Path::new("/ws/7"), &env(&[]))
            .unwrap();
        assert!(cmd.starts_with("docker run --rm"));
        assert!(cmd.contains("-v '/ws/7:/workspace'"));
        assert!(cmd.contains("-w '/workspace'"));
        assert!(cmd.contains("'rust:1.85'"));
        assert!(cmd.ends_with("sh -c 'cargo test'"));
    }

    #[test]
    fn env_is_injected_by_name_only() {
        let spec = ContainerSpec::image("alpine");
        let cmd = build_invocation(
            &spec,
            None,
            Path::new("/ws"),
            &env(&[("API_TOKEN", "hunter2")]),
        )
        .unwrap();
        assert!(cmd.contains("-e 'API_TOKEN'"));
        assert!(!cmd.contains("hunter2"), "secret value leaked into the command line");
    }

    #[test]
    fn invalid_image_is_rejected() {
        let spec = ContainerSpec::image("-bad image");
        assert_eq!(
            build_invocation(&spec, None, Path::new("/ws"), &env(&[])),
            Err(ContainerError::InvalidImage("-bad image".into()))
        );
    }

    #[test]
    fn named_volumes_are_validated() {
        let mut spec = ContainerSpec::image("alpine");
        spec.volumes.push("build-cache:/var/cache".into());
        let cmd = build_invocation(&spec, None, Path::new("/ws"), &env(&[])).unwrap();
        assert!(cmd.contains("-v 'build-cache:/var/cache'"));

        spec.volumes[0] = "bad name:/var/cache".into();
        assert!(matches!(
            build_invocation(&spec, None, Path::new("/ws"), &env(&[])),
            Err(ContainerError::InvalidVolumeName(_))
        ));
    }

    #[test]
    fn mount_paths_must_be_absolute_without_dotdot() {
        let mut spec = ContainerSpec::image("alpine");
        spec.volumes.push("cache:relative/path".into());
        assert!(matches!(
            build_invocation(&spec, None, Path::new("/ws"), &env(&[])),
            Err(ContainerError::InvalidMountPath(_))
        ));

        spec.volumes[0] = "cache:/var/../etc".into();
        assert!(matches!(
            build_invocation(&spec, None, Path::new("/ws"), &env(&[])),
            Err(ContainerError::InvalidMountPath(_))
        ));
    }

    #[test]
    fn volume_without_separator_is_rejected() {
        let mut spec = ContainerSpec::image("alpine");
        spec.volumes.push("justaname".into());
        assert!(matches!(
            build_invocation(&spec, None, Path::new("/ws"), &env(&[])),
            Err(ContainerError::InvalidVolume(_))
        ));
    }

    #[test]
    fn command_injection_is_neutralised_by_quoting() {
        let spec = ContainerSpec::image("alpine");
        let cmd = build_invocation(
            &spec,
            Some("echo hi'; rm -rf /; echo '"),
            Path::new("/ws"),
            &env(&[]),
        )
        .unwrap();
        // The embedded quote is escaped, so the payload stays one argument.
        assert!(cmd.contains(r"'\''"));
    }

    #[test]
    fn pull_policy_and_network_are_rendered() {
        let mut spec = ContainerSpec::image("alpine");
        spec.pull_policy = PullPolicy::Always;
        spec.network = Some("host".into());
        let cmd = build_invocation(&spec, None, Path::new("/ws"), &env(&[])).unwrap();
        assert!(cmd.contains("--pull=always"));
        assert!(cmd.contains("--network 'host'"));
    }

    #[test]
    fn extra_args_are_quoted() {
        let mut spec = ContainerSpec::image("alpine");
        spec.extra_args.push("--cap-drop=ALL".into());
        let cmd = build_invocation(&spec, None, Path::new("/ws"), &env(&[])).unwrap();
        assert!(cmd.contains("'--cap-drop=ALL'"));
    }
}
