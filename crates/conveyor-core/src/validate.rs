// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-execution validation of pipeline definitions.
//!
//! Everything here is detected before a single step runs; the lifecycle
//! manager turns a validation error into a fast-failed build with reason.

use crate::dag::DepGraph;
use crate::pipeline::{Pipeline, Stage, StepKind};
use std::collections::BTreeSet;
use thiserror::Error;

/// A structural problem in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two stages share a name.
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    /// A stage has no steps.
    #[error("stage '{0}' has no steps")]
    EmptyStage(String),

    /// Two steps within one stage share a name.
    #[error("duplicate step name '{step}' in stage '{stage}'")]
    DuplicateStep {
        /// Stage containing the duplicates.
        stage: String,
        /// The repeated step name.
        step: String,
    },

    /// A `depends_on` entry references no stage.
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// Stage with the bad reference.
        stage: String,
        /// The name that resolved to nothing.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A container step carries an empty or malformed image reference.
    #[error("invalid container image '{image}' in stage '{stage}'")]
    InvalidImage {
        /// Stage containing the step.
        stage: String,
        /// The offending reference.
        image: String,
    },

    /// A matrix dimension has no values.
    #[error("matrix dimension '{0}' has no values")]
    EmptyMatrixDimension(String),

    /// Cartesian expansion exceeds the configured maximum.
    #[error("matrix expands to {count} combinations (max {max})")]
    MatrixTooLarge {
        /// Number of combinations before exclusions.
        count: usize,
        /// Configured ceiling.
        max: usize,
    },
}

/// Accept an image reference of the form `[registry/]name[:tag][@digest]`.
///
/// The check is syntactic: non-empty, no whitespace, does not begin with a
/// separator, and only characters that appear in OCI references.
#[must_use]
pub fn is_valid_image_ref(image: &str) -> bool {
    if image.is_empty() || image.len() > 255 {
        return false;
    }
    let first = image.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    image
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'))
}

/// Validate a pipeline definition, returning the first problem found.
///
/// `max_matrix` bounds the cartesian expansion size.
///
/// # Errors
///
/// Returns the first [`ValidationError`] detected, checking stages before
/// the dependency graph and the graph before the matrix.
pub fn validate_pipeline(pipeline: &Pipeline, max_matrix: usize) -> Result<(), ValidationError> {
    let mut seen_stages = BTreeSet::new();
    for stage in &pipeline.stages {
        if !seen_stages.insert(stage.name.as_str()) {
            return Err(ValidationError::DuplicateStage(stage.name.clone()));
        }
        validate_stage(stage)?;
    }

    let graph = DepGraph::from_stages(
        pipeline
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.as_slice())),
    );
    if let Some((stage, dependency)) = graph.unknown_dependency() {
        return Err(ValidationError::UnknownDependency { stage, dependency });
    }
    if let Some(cycle) = graph.find_cycle() {
        return Err(ValidationError::DependencyCycle(cycle));
    }

    if let Some(matrix) = &pipeline.matrix {
        for (dim, values) in &matrix.dimensions {
            if values.is_empty() {
                return Err(ValidationError::EmptyMatrixDimension(dim.clone()));
            }
        }
        let count = matrix.combination_count();
        if count > max_matrix {
            return Err(ValidationError::MatrixTooLarge { count, max: max_matrix });
        }
    }

    Ok(())
}

fn validate_stage(stage: &Stage) -> Result<(), ValidationError> {
    if stage.steps.is_empty() {
        return Err(ValidationError::EmptyStage(stage.name.clone()));
    }
    let mut seen_steps = BTreeSet::new();
    for step in &stage.steps {
        if !seen_steps.insert(step.name.as_str()) {
            return Err(ValidationError::DuplicateStep {
                stage: stage.name.clone(),
                step: step.name.clone(),
            });
        }
        if let StepKind::Container { spec, .. } = &step.kind {
            if !is_valid_image_ref(&spec.image) {
                return Err(ValidationError::InvalidImage {
                    stage: stage.name.clone(),
                    image: spec.image.clone(),
                });
            }
        }
    }
    if let Some(container) = &stage.container {
        if !is_valid_image_ref(&container.image) {
            return Err(ValidationError::InvalidImage {
                stage: stage.name.clone(),
                image: container.image.clone(),
            });
        }
    }
    Ok(())
}
