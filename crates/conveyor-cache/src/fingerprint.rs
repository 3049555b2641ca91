// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stage result cache fingerprinting.
//!
//! A fingerprint is a SHA-256 over the canonical JSON of the stage
//! definition plus the resolved inputs that can change step behaviour:
//! the sorted parameter map, the git branch, and the commit. Volatile
//! values (build id, build number, timestamps) are deliberately excluded
//! so re-runs of identical work can hit. The chosen input set is recorded
//! on every cached result for diagnosis.

use chrono::{DateTime, Utc};
use conveyor_core::{Stage, StageResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A computed stage fingerprint plus the inputs that went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFingerprint {
    /// Hex SHA-256 of the input material.
    pub value: String,
    /// Names of the inputs hashed, for the diagnostic field.
    pub inputs: Vec<String>,
}

impl StageFingerprint {
    /// Compute the fingerprint for a stage under the given resolved inputs.
    ///
    /// Returns `None` when the stage definition cannot be serialised (it
    /// always can for well-formed pipelines; this guards plug-in configs
    /// with non-serialisable values).
    #[must_use]
    pub fn compute(
        stage: &Stage,
        parameters: &BTreeMap<String, String>,
        branch: Option<&str>,
        commit: Option<&str>,
    ) -> Option<Self> {
        let stage_json = serde_json::to_string(stage).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(stage_json.as_bytes());
        hasher.update(b"\x00params\x00");
        for (k, v) in parameters {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\x00");
        }
        hasher.update(b"branch\x00");
        hasher.update(branch.unwrap_or("").as_bytes());
        hasher.update(b"\x00commit\x00");
        hasher.update(commit.unwrap_or("").as_bytes());

        let digest = hasher.finalize();
        Some(Self {
            value: format!("{digest:x}"),
            inputs: vec![
                "stage-definition".to_string(),
                "parameters".to_string(),
                "git.branch".to_string(),
                "git.commit".to_string(),
            ],
        })
    }
}

/// A stage result persisted under its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedStageResult {
    /// Owning job.
    pub job: String,
    /// Fingerprint the result is keyed by.
    pub fingerprint: String,
    /// The successful stage result to replay.
    pub result: StageResult,
    /// Which inputs produced the fingerprint.
    pub fingerprint_inputs: Vec<String>,
    /// When the result was stored.
    pub stored_at: DateTime<Utc>,
}

/// Persistence contract for the stage result cache.
#[async_trait::async_trait]
pub trait ResultCache: Send + Sync {
    /// Look up a prior successful result for this job and fingerprint.
    async fn get_result(
        &self,
        job: &str,
        fingerprint: &str,
    ) -> anyhow::Result<Option<CachedStageResult>>;
    /// Store a successful result under its fingerprint.
    async fn put_result(&self, result: &CachedStageResult) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::Step;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn stage() -> Stage {
        Stage::new("Build", vec![Step::shell("Compile", "make")])
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let a = StageFingerprint::compute(&stage(), &params(&[("x", "1")]), Some("main"), Some("abc"));
        let b = StageFingerprint::compute(&stage(), &params(&[("x", "1")]), Some("main"), Some("abc"));
        assert_eq!(a, b);
    }

    #[test]
    fn each_input_perturbs_the_fingerprint() {
        let base = StageFingerprint::compute(&stage(), &params(&[]), Some("main"), Some("abc"))
            .unwrap()
            .value;

        let mut other_stage = stage();
        other_stage.steps[0] = Step::shell("Compile", "make -j8");
        let changed_stage =
            StageFingerprint::compute(&other_stage, &params(&[]), Some("main"), Some("abc"))
                .unwrap()
                .value;
        assert_ne!(base, changed_stage);

        let changed_params =
            StageFingerprint::compute(&stage(), &params(&[("env", "prod")]), Some("main"), Some("abc"))
                .unwrap()
                .value;
        assert_ne!(base, changed_params);

        let changed_branch =
            StageFingerprint::compute(&stage(), &params(&[]), Some("develop"), Some("abc"))
                .unwrap()
                .value;
        assert_ne!(base, changed_branch);

        let changed_commit =
            StageFingerprint::compute(&stage(), &params(&[]), Some("main"), Some("def"))
                .unwrap()
                .value;
        assert_ne!(base, changed_commit);
    }

    #[test]
    fn inputs_field_documents_the_chosen_set() {
        let fp = StageFingerprint::compute(&stage(), &params(&[]), None, None).unwrap();
        assert_eq!(
            fp.inputs,
            vec!["stage-definition", "parameters", "git.branch", "git.commit"]
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = StageFingerprint::compute(&stage(), &params(&[]), None, None).unwrap();
        assert_eq!(fp.value.len(), 64);
        assert!(fp.value.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
