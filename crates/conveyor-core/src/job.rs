// SPDX-License-Identifier: MIT OR Apache-2.0
//! Jobs: named bindings of a pipeline to an organization.

use crate::pipeline::Pipeline;
use serde::{Deserialize, Serialize};

/// A registered job.
///
/// The job owns the server-side pipeline definition; every build receives
/// its own copy, so later edits never affect builds already in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job name, unique within the organization.
    pub name: String,
    /// Organization scope.
    pub org: String,
    /// The registered pipeline definition.
    pub pipeline: Pipeline,
    /// Paused jobs are never triggered.
    #[serde(default)]
    pub paused: bool,
}

impl Job {
    /// Create an active job.
    #[must_use]
    pub fn new(name: impl Into<String>, org: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            name: name.into(),
            org: org.into(),
            pipeline,
            paused: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Stage, Step};

    #[test]
    fn new_job_is_active() {
        let job = Job::new(
            "deploy",
            "acme",
            Pipeline::new("p", vec![Stage::new("s", vec![Step::shell("x", "true")])]),
        );
        assert!(!job.paused);
        assert_eq!(job.org, "acme");
    }
}
