// SPDX-License-Identifier: MIT OR Apache-2.0
//! Matrix expansion: one stage clone per combination, with a name suffix
//! and `MATRIX_<DIM>` environment additions.

use crate::env::env_name;
use conveyor_core::{MatrixConfig, Stage};
use std::collections::BTreeMap;

/// A stage ready to schedule, with its extra environment.
#[derive(Debug, Clone)]
pub struct StageUnit {
    /// The (possibly cloned-and-renamed) stage.
    pub stage: Stage,
    /// Environment layered on top of the build overlay for this stage.
    pub extra_env: BTreeMap<String, String>,
}

impl StageUnit {
    /// A plain unit with no extra environment.
    #[must_use]
    pub fn plain(stage: Stage) -> Self {
        Self {
            stage,
            extra_env: BTreeMap::new(),
        }
    }
}

/// All value assignments for the matrix dimensions, exclusions applied.
///
/// Dimensions iterate in sorted order, so combination order — and thus
/// expanded stage naming — is deterministic.
fn combinations(matrix: &MatrixConfig) -> Vec<BTreeMap<String, String>> {
    let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for (dim, values) in &matrix.dimensions {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(dim.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos.retain(|combo| !excluded(matrix, combo));
    combos
}

/// A combination is excluded when it agrees with every pair of an
/// exclusion entry.
fn excluded(matrix: &MatrixConfig, combo: &BTreeMap<String, String>) -> bool {
    matrix.exclude.iter().any(|filter| {
        !filter.is_empty()
            && filter
                .iter()
                .all(|(dim, value)| combo.get(dim) == Some(value))
    })
}

/// Render the name suffix for a combination: `[k1=v1, k2=v2]`.
fn suffix(combo: &BTreeMap<String, String>) -> String {
    let parts: Vec<String> = combo.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("[{}]", parts.join(", "))
}

/// Expand stages against an optional matrix configuration.
///
/// Without a matrix (or with an empty one) every stage passes through
/// unchanged. With one, each stage is cloned per combination; clones get
/// the suffix appended to their name and to their dependency references,
/// plus `MATRIX_<DIM>` env additions.
#[must_use]
pub fn expand(stages: Vec<Stage>, matrix: Option<&MatrixConfig>) -> Vec<StageUnit> {
    let Some(matrix) = matrix.filter(|m| !m.dimensions.is_empty()) else {
        return stages.into_iter().map(StageUnit::plain).collect();
    };

    let combos = combinations(matrix);
    let mut units = Vec::with_capacity(stages.len() * combos.len());
    for stage in &stages {
        for combo in &combos {
            let suffix = suffix(combo);
            let mut clone = stage.clone();
            clone.name = format!("{} {}", stage.name, suffix);
            // Dependencies point at the same combination of the upstream stage.
            clone.depends_on = stage
                .depends_on
                .iter()
                .map(|dep| format!("{dep} {suffix}"))
                .collect();
            let extra_env = combo
                .iter()
                .map(|(dim, value)| (format!("MATRIX_{}", env_name(dim)), value.clone()))
                .collect();
            units.push(StageUnit {
                stage: clone,
                extra_env,
            });
        }
    }
    units
}
