// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment overlay computation.
//!
//! Precedence (later wins): build identity → git → secrets → parameters →
//! caller-supplied env. Matrix additions are layered per-stage by the
//! expander.

use conveyor_core::Build;
use std::collections::BTreeMap;
use std::path::Path;

/// `PARAM_` prefix applied to every build parameter.
const PARAM_PREFIX: &str = "PARAM_";

/// Uppercase a name for the environment, mapping dashes to underscores.
#[must_use]
pub fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// Compute the environment overlay injected into every step of a build.
#[must_use]
pub fn build_env(
    build: &Build,
    workspace: &Path,
    secrets: &BTreeMap<String, String>,
    caller_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("BUILD_ID".to_string(), build.id.to_string());
    env.insert("BUILD_NUMBER".to_string(), build.number.to_string());
    env.insert("JOB_NAME".to_string(), build.job.clone());
    env.insert("WORKSPACE".to_string(), workspace.display().to_string());

    if let Some(git) = &build.git {
        env.insert("GIT_BRANCH".to_string(), git.branch.clone());
        env.insert("GIT_COMMIT".to_string(), git.commit.clone());
        env.insert("GIT_COMMIT_SHORT".to_string(), git.commit_short.clone());
        env.insert("GIT_AUTHOR".to_string(), git.author.clone());
        env.insert("GIT_MESSAGE".to_string(), git.message.clone());
    }

    for (name, value) in secrets {
        env.insert(name.clone(), value.clone());
    }

    for (name, value) in &build.parameters {
        env.insert(format!("{PARAM_PREFIX}{}", env_name(name)), value.clone());
    }

    for (name, value) in caller_env {
        env.insert(name.clone(), value.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{GitInfo, TriggerKind};

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identity_entries_are_always_present() {
        let build = Build::new("deploy", "acme", 9, TriggerKind::Manual);
        let env = build_env(&build, Path::new("/ws"), &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(env["BUILD_ID"], build.id.to_string());
        assert_eq!(env["BUILD_NUMBER"], "9");
        assert_eq!(env["JOB_NAME"], "deploy");
        assert_eq!(env["WORKSPACE"], "/ws");
        assert!(!env.contains_key("GIT_BRANCH"));
    }

    #[test]
    fn git_entries_appear_after_checkout() {
        let mut build = Build::new("deploy", "acme", 1, TriggerKind::Webhook);
        build.git = Some(GitInfo {
            branch: "main".into(),
            commit: "abc123def456".into(),
            commit_short: "abc123d".into(),
            author: "dev".into(),
            message: "fix the thing".into(),
        });
        let env = build_env(&build, Path::new("/ws"), &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(env["GIT_BRANCH"], "main");
        assert_eq!(env["GIT_COMMIT_SHORT"], "abc123d");
        assert_eq!(env["GIT_MESSAGE"], "fix the thing");
    }

    #[test]
    fn parameters_are_prefixed_and_upcased() {
        let mut build = Build::new("j", "o", 1, TriggerKind::Manual);
        build.parameters = map(&[("deploy-env", "prod"), ("region", "eu")]);
        let env = build_env(&build, Path::new("/ws"), &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(env["PARAM_DEPLOY_ENV"], "prod");
        assert_eq!(env["PARAM_REGION"], "eu");
    }

    #[test]
    fn secrets_are_injected_by_name() {
        let build = Build::new("j", "o", 1, TriggerKind::Manual);
        let env = build_env(
            &build,
            Path::new("/ws"),
            &map(&[("API_TOKEN", "hunter2")]),
            &BTreeMap::new(),
        );
        assert_eq!(env["API_TOKEN"], "hunter2");
    }

    #[test]
    fn caller_env_wins_over_everything() {
        let build = Build::new("j", "o", 1, TriggerKind::Manual);
        let env = build_env(
            &build,
            Path::new("/ws"),
            &map(&[("SHARED", "secret")]),
            &map(&[("SHARED", "caller")]),
        );
        assert_eq!(env["SHARED"], "caller");
    }

    #[test]
    fn env_name_mapping() {
        assert_eq!(env_name("deploy-env"), "DEPLOY_ENV");
        assert_eq!(env_name("os"), "OS");
        assert_eq!(env_name("jdk_version"), "JDK_VERSION");
    }
}
