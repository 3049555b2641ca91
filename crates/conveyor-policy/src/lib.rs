// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-stage policy evaluation.
//!
//! Before a stage runs, the engine loads the enabled policies for the
//! build's organization, ordered by priority, and dispatches each on its
//! rule kind. Any deny fails fast with the first denial; `required-approval`
//! rules never deny — they emit overrides that amplify the stage's approval
//! requirement. Every evaluation is recorded as an audit entry and logged.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Rule payloads and the policy record.
pub mod rules;

pub use rules::{
    DayOfWeek, ParamOperator, Policy, PolicyRule, RestrictionAction, TimeWindowAction,
};

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from policy evaluation itself (not denials).
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A branch/author/stage pattern failed to compile.
    #[error("policy '{policy}' has an invalid pattern '{pattern}'")]
    InvalidPattern {
        /// Policy name.
        policy: String,
        /// The offending glob.
        pattern: String,
    },

    /// A time-window rule names an unknown timezone.
    #[error("policy '{policy}' has an unknown timezone '{timezone}'")]
    UnknownTimezone {
        /// Policy name.
        policy: String,
        /// The offending zone name.
        timezone: String,
    },
}

// ---------------------------------------------------------------------------
// Evaluation input and output
// ---------------------------------------------------------------------------

/// Everything a rule can look at.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    /// Build under evaluation.
    pub build_id: Uuid,
    /// Owning job.
    pub job: String,
    /// Stage about to run.
    pub stage: String,
    /// Resolved git branch, when a checkout happened.
    pub branch: Option<String>,
    /// Resolved git author, when a checkout happened.
    pub author: Option<String>,
    /// Effective build parameters.
    pub parameters: BTreeMap<String, String>,
    /// Evaluation instant; injected for testability.
    pub now: DateTime<Utc>,
}

/// Approval amplification emitted by a `required-approval` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOverride {
    /// Minimum approvals the matching policy demands.
    pub min_approvals: u32,
    /// Approver group to union into the gate, if any.
    pub approver_group: Option<String>,
    /// Name of the policy that emitted the override.
    pub policy: String,
}

/// Aggregate decision for one stage entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No policy denied the stage.
    Allow,
    /// A policy denied the stage; evaluation stopped there.
    Deny {
        /// Name of the denying policy.
        policy: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl Decision {
    /// `true` when the stage may proceed.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// What a single policy concluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditResult {
    /// The policy allowed the stage.
    Allowed,
    /// The policy denied the stage.
    Denied {
        /// Why.
        reason: String,
    },
    /// The policy emitted an approval override.
    Override {
        /// Amplified minimum approvals.
        min_approvals: u32,
    },
}

/// One recorded policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Policy name.
    pub policy: String,
    /// Build under evaluation.
    pub build_id: Uuid,
    /// Stage under evaluation.
    pub stage: String,
    /// What the policy concluded.
    pub result: AuditResult,
    /// Evaluation instant.
    pub at: DateTime<Utc>,
}

/// Outcome of evaluating all policies for one stage entry.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    /// Aggregate allow/deny.
    pub decision: Decision,
    /// Accumulated approval overrides (empty on deny).
    pub overrides: Vec<ApprovalOverride>,
    /// Per-policy audit trail, in evaluation order.
    pub audit: Vec<AuditEntry>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless policy evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    /// Evaluate `policies` (already filtered to enabled, sorted by priority)
    /// against a stage entry.
    ///
    /// Denies fail fast: the first denial short-circuits the remaining
    /// policies. Overrides accumulate across every `required-approval` rule
    /// whose stage patterns match.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] when a policy definition itself is
    /// malformed (bad glob, unknown timezone). Callers fail closed on it.
    pub fn evaluate(
        &self,
        policies: &[Policy],
        ctx: &PolicyContext,
    ) -> Result<EvaluationOutcome, PolicyError> {
        let mut overrides = Vec::new();
        let mut audit = Vec::new();

        for policy in policies.iter().filter(|p| p.enabled) {
            let verdict = self.evaluate_one(policy, ctx)?;
            log_verdict(policy, ctx, &verdict);
            audit.push(AuditEntry {
                policy: policy.name.clone(),
                build_id: ctx.build_id,
                stage: ctx.stage.clone(),
                result: verdict.clone(),
                at: ctx.now,
            });
            match verdict {
                AuditResult::Allowed => {}
                AuditResult::Denied { reason } => {
                    return Ok(EvaluationOutcome {
                        decision: Decision::Deny {
                            policy: policy.name.clone(),
                            reason,
                        },
                        overrides: Vec::new(),
                        audit,
                    });
                }
                AuditResult::Override { .. } => {
                    if let PolicyRule::RequiredApproval {
                        min_approvals,
                        approver_group,
                        ..
                    } = &policy.rule
                    {
                        overrides.push(ApprovalOverride {
                            min_approvals: *min_approvals,
                            approver_group: approver_group.clone(),
                            policy: policy.name.clone(),
                        });
                    }
                }
            }
        }

        Ok(EvaluationOutcome {
            decision: Decision::Allow,
            overrides,
            audit,
        })
    }

    fn evaluate_one(&self, policy: &Policy, ctx: &PolicyContext) -> Result<AuditResult, PolicyError> {
        match &policy.rule {
            PolicyRule::BranchRestriction { branches, action } => Ok(restriction(
                &policy.name,
                "branch",
                branches,
                *action,
                ctx.branch.as_deref(),
            )?),
            PolicyRule::AuthorRestriction { authors, action } => Ok(restriction(
                &policy.name,
                "author",
                authors,
                *action,
                ctx.author.as_deref(),
            )?),
            PolicyRule::TimeWindow {
                timezone,
                days,
                start_hour,
                end_hour,
                action,
            } => time_window(policy, timezone, days, *start_hour, *end_hour, *action, ctx.now),
            PolicyRule::ParameterRestriction {
                parameter,
                operator,
                value,
                action,
            } => Ok(parameter_restriction(
                parameter,
                *operator,
                value.as_deref(),
                *action,
                &ctx.parameters,
            )),
            PolicyRule::RequiredApproval {
                stages,
                min_approvals,
                ..
            } => {
                if any_match(&policy.name, stages, &ctx.stage)? {
                    Ok(AuditResult::Override {
                        min_approvals: *min_approvals,
                    })
                } else {
                    Ok(AuditResult::Allowed)
                }
            }
        }
    }
}

fn log_verdict(policy: &Policy, ctx: &PolicyContext, verdict: &AuditResult) {
    match verdict {
        AuditResult::Allowed => debug!(
            target: "conveyor.policy",
            policy = %policy.name,
            build_id = %ctx.build_id,
            stage = %ctx.stage,
            "policy allowed stage"
        ),
        AuditResult::Denied { reason } => info!(
            target: "conveyor.policy",
            policy = %policy.name,
            build_id = %ctx.build_id,
            stage = %ctx.stage,
            reason = %reason,
            branch = ctx.branch.as_deref().unwrap_or(""),
            author = ctx.author.as_deref().unwrap_or(""),
            "policy denied stage"
        ),
        AuditResult::Override { min_approvals } => info!(
            target: "conveyor.policy",
            policy = %policy.name,
            build_id = %ctx.build_id,
            stage = %ctx.stage,
            min_approvals,
            "policy amplified approval requirement"
        ),
    }
}

// ---------------------------------------------------------------------------
// Rule evaluators
// ---------------------------------------------------------------------------

/// Glob match where `*` stays within one path segment and `**` crosses.
fn pattern_matches(policy: &str, pattern: &str, candidate: &str) -> Result<bool, PolicyError> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|_| PolicyError::InvalidPattern {
            policy: policy.to_string(),
            pattern: pattern.to_string(),
        })?;
    Ok(glob.compile_matcher().is_match(candidate))
}

fn any_match(policy: &str, patterns: &[String], candidate: &str) -> Result<bool, PolicyError> {
    for pattern in patterns {
        if pattern_matches(policy, pattern, candidate)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Shared allow-list / deny-list semantics for branch and author rules.
fn restriction(
    policy: &str,
    what: &str,
    patterns: &[String],
    action: RestrictionAction,
    candidate: Option<&str>,
) -> Result<AuditResult, PolicyError> {
    let matched = match candidate {
        Some(value) => any_match(policy, patterns, value)?,
        None => false,
    };
    let result = match action {
        RestrictionAction::Allow if !matched => AuditResult::Denied {
            reason: format!(
                "{what} '{}' matches no allowed pattern",
                candidate.unwrap_or("<unknown>")
            ),
        },
        RestrictionAction::Deny if matched => AuditResult::Denied {
            reason: format!(
                "{what} '{}' matches a denied pattern",
                candidate.unwrap_or("<unknown>")
            ),
        },
        _ => AuditResult::Allowed,
    };
    Ok(result)
}

fn time_window(
    policy: &Policy,
    timezone: &str,
    days: &[DayOfWeek],
    start_hour: u8,
    end_hour: u8,
    action: TimeWindowAction,
    now: DateTime<Utc>,
) -> Result<AuditResult, PolicyError> {
    let tz: Tz = timezone.parse().map_err(|_| PolicyError::UnknownTimezone {
        policy: policy.name.clone(),
        timezone: timezone.to_string(),
    })?;
    let local = now.with_timezone(&tz);
    let day = DayOfWeek::from_weekday(local.weekday());
    let hour = local.hour() as u8;
    // Half-open window [start, end).
    let in_window = days.contains(&day) && hour >= start_hour && hour < end_hour;

    let result = match action {
        TimeWindowAction::AllowOnly if !in_window => AuditResult::Denied {
            reason: format!(
                "outside allowed window {start_hour:02}:00-{end_hour:02}:00 {timezone}"
            ),
        },
        TimeWindowAction::DenyDuring if in_window => AuditResult::Denied {
            reason: format!(
                "inside denied window {start_hour:02}:00-{end_hour:02}:00 {timezone}"
            ),
        },
        _ => AuditResult::Allowed,
    };
    if matches!(result, AuditResult::Denied { .. }) {
        warn!(
            target: "conveyor.policy",
            policy = %policy.name,
            local_time = %local.to_rfc3339(),
            "time window rule denied"
        );
    }
    Ok(result)
}

fn parameter_restriction(
    parameter: &str,
    operator: ParamOperator,
    value: Option<&str>,
    action: RestrictionAction,
    parameters: &BTreeMap<String, String>,
) -> AuditResult {
    let actual = parameters.get(parameter).map(String::as_str);
    let matched = match operator {
        ParamOperator::Equals => actual.is_some() && actual == value,
        ParamOperator::NotEquals => actual.is_some() && actual != value,
        ParamOperator::Contains => match (actual, value) {
            (Some(a), Some(v)) => a.contains(v),
            _ => false,
        },
        ParamOperator::Exists => actual.is_some(),
        ParamOperator::NotExists => actual.is_none(),
    };
    match action {
        RestrictionAction::Allow if !matched => AuditResult::Denied {
            reason: format!("parameter '{parameter}' does not satisfy the allow condition"),
        },
        RestrictionAction::Deny if matched => AuditResult::Denied {
            reason: format!("parameter '{parameter}' matches the deny condition"),
        },
        _ => AuditResult::Allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(stage: &str, branch: Option<&str>) -> PolicyContext {
        PolicyContext {
            build_id: Uuid::new_v4(),
            job: "deploy".into(),
            stage: stage.into(),
            branch: branch.map(String::from),
            author: Some("dev@acme.example".into()),
            parameters: BTreeMap::new(),
            now: Utc.with_ymd_and_hms(2024, 3, 13, 12, 0, 0).unwrap(), // a Wednesday
        }
    }

    fn policy(name: &str, rule: PolicyRule) -> Policy {
        Policy {
            id: Uuid::new_v4(),
            org: "acme".into(),
            name: name.into(),
            enabled: true,
            priority: 10,
            rule,
        }
    }

    #[test]
    fn branch_allow_list_denies_unlisted_branch() {
        let p = policy(
            "main-only",
            PolicyRule::BranchRestriction {
                branches: vec!["main".into(), "release/*".into()],
                action: RestrictionAction::Allow,
            },
        );
        let out = PolicyEngine
            .evaluate(&[p], &ctx("Deploy", Some("feature/x")))
            .unwrap();
        assert!(!out.decision.is_allow());

        let out = PolicyEngine
            .evaluate(
                &[policy(
                    "main-only",
                    PolicyRule::BranchRestriction {
                        branches: vec!["main".into(), "release/*".into()],
                        action: RestrictionAction::Allow,
                    },
                )],
                &ctx("Deploy", Some("release/1.2")),
            )
            .unwrap();
        assert!(out.decision.is_allow());
    }

    #[test]
    fn single_star_does_not_cross_slash() {
        let p = policy(
            "releases",
            PolicyRule::BranchRestriction {
                branches: vec!["release/*".into()],
                action: RestrictionAction::Allow,
            },
        );
        let out = PolicyEngine
            .evaluate(&[p.clone()], &ctx("Deploy", Some("release/1.2/hotfix")))
            .unwrap();
        assert!(!out.decision.is_allow(), "* must not cross a path separator");

        let p2 = policy(
            "releases",
            PolicyRule::BranchRestriction {
                branches: vec!["release/**".into()],
                action: RestrictionAction::Allow,
            },
        );
        let out = PolicyEngine
            .evaluate(&[p2], &ctx("Deploy", Some("release/1.2/hotfix")))
            .unwrap();
        assert!(out.decision.is_allow(), "** crosses separators");
    }

    #[test]
    fn branch_deny_list_blocks_matches() {
        let p = policy(
            "no-experiments",
            PolicyRule::BranchRestriction {
                branches: vec!["experiment/*".into()],
                action: RestrictionAction::Deny,
            },
        );
        let engine = PolicyEngine;
        assert!(!engine
            .evaluate(&[p.clone()], &ctx("Build", Some("experiment/wild")))
            .unwrap()
            .decision
            .is_allow());
        assert!(engine
            .evaluate(&[p], &ctx("Build", Some("main")))
            .unwrap()
            .decision
            .is_allow());
    }

    #[test]
    fn missing_branch_fails_an_allow_list() {
        let p = policy(
            "main-only",
            PolicyRule::BranchRestriction {
                branches: vec!["main".into()],
                action: RestrictionAction::Allow,
            },
        );
        let out = PolicyEngine.evaluate(&[p], &ctx("Build", None)).unwrap();
        assert!(!out.decision.is_allow());
    }

    #[test]
    fn author_restriction_shares_semantics() {
        let p = policy(
            "employees-only",
            PolicyRule::AuthorRestriction {
                authors: vec!["*@acme.example".into()],
                action: RestrictionAction::Allow,
            },
        );
        let out = PolicyEngine.evaluate(&[p], &ctx("Build", Some("main"))).unwrap();
        assert!(out.decision.is_allow());
    }

    #[test]
    fn time_window_allow_only_denies_outside() {
        // Wednesday 12:00 UTC. Window: MON-FRI 9-17 UTC → inside.
        let inside = policy(
            "office-hours",
            PolicyRule::TimeWindow {
                timezone: "UTC".into(),
                days: vec![
                    DayOfWeek::Mon,
                    DayOfWeek::Tue,
                    DayOfWeek::Wed,
                    DayOfWeek::Thu,
                    DayOfWeek::Fri,
                ],
                start_hour: 9,
                end_hour: 17,
                action: TimeWindowAction::AllowOnly,
            },
        );
        assert!(PolicyEngine
            .evaluate(&[inside], &ctx("Deploy", Some("main")))
            .unwrap()
            .decision
            .is_allow());

        // Same instant, weekend-only window → denied.
        let weekend = policy(
            "weekend-only",
            PolicyRule::TimeWindow {
                timezone: "UTC".into(),
                days: vec![DayOfWeek::Sat, DayOfWeek::Sun],
                start_hour: 0,
                end_hour: 24,
                action: TimeWindowAction::AllowOnly,
            },
        );
        assert!(!PolicyEngine
            .evaluate(&[weekend], &ctx("Deploy", Some("main")))
            .unwrap()
            .decision
            .is_allow());
    }

    #[test]
    fn time_window_respects_timezone() {
        // 12:00 UTC is 07:00 in New York (EST would be 07:00 in March DST → EDT 08:00).
        let p = policy(
            "ny-office-hours",
            PolicyRule::TimeWindow {
                timezone: "America/New_York".into(),
                days: vec![DayOfWeek::Wed],
                start_hour: 9,
                end_hour: 17,
                action: TimeWindowAction::AllowOnly,
            },
        );
        let out = PolicyEngine.evaluate(&[p], &ctx("Deploy", Some("main"))).unwrap();
        assert!(!out.decision.is_allow(), "07/08:00 local is before the window");
    }

    #[test]
    fn deny_during_blocks_inside_window() {
        let p = policy(
            "change-freeze",
            PolicyRule::TimeWindow {
                timezone: "UTC".into(),
                days: vec![DayOfWeek::Wed],
                start_hour: 0,
                end_hour: 24,
                action: TimeWindowAction::DenyDuring,
            },
        );
        let out = PolicyEngine.evaluate(&[p], &ctx("Deploy", Some("main"))).unwrap();
        assert!(!out.decision.is_allow());
    }

    #[test]
    fn unknown_timezone_is_a_policy_error() {
        let p = policy(
            "bad-tz",
            PolicyRule::TimeWindow {
                timezone: "Mars/Olympus".into(),
                days: vec![DayOfWeek::Mon],
                start_hour: 0,
                end_hour: 1,
                action: TimeWindowAction::AllowOnly,
            },
        );
        let err = PolicyEngine.evaluate(&[p], &ctx("Deploy", None)).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownTimezone { .. }));
    }

    #[test]
    fn parameter_operators() {
        let mut c = ctx("Deploy", Some("main"));
        c.parameters.insert("env".into(), "production".into());

        let cases: Vec<(ParamOperator, Option<&str>, RestrictionAction, bool)> = vec![
            (ParamOperator::Equals, Some("production"), RestrictionAction::Deny, false),
            (ParamOperator::Equals, Some("staging"), RestrictionAction::Deny, true),
            (ParamOperator::NotEquals, Some("staging"), RestrictionAction::Deny, false),
            (ParamOperator::Contains, Some("prod"), RestrictionAction::Deny, false),
            (ParamOperator::Exists, None, RestrictionAction::Deny, false),
            (ParamOperator::NotExists, None, RestrictionAction::Deny, true),
        ];
        for (operator, value, action, expect_allow) in cases {
            let p = policy(
                "param-rule",
                PolicyRule::ParameterRestriction {
                    parameter: "env".into(),
                    operator,
                    value: value.map(String::from),
                    action,
                },
            );
            let out = PolicyEngine.evaluate(&[p], &c).unwrap();
            assert_eq!(
                out.decision.is_allow(),
                expect_allow,
                "operator {operator:?} value {value:?}"
            );
        }
    }

    #[test]
    fn required_approval_emits_override_not_deny() {
        let p = policy(
            "prod-needs-two",
            PolicyRule::RequiredApproval {
                stages: vec!["Deploy*".into()],
                min_approvals: 2,
                approver_group: Some("release-managers".into()),
            },
        );
        let out = PolicyEngine.evaluate(&[p], &ctx("Deploy", Some("main"))).unwrap();
        assert!(out.decision.is_allow());
        assert_eq!(out.overrides.len(), 1);
        assert_eq!(out.overrides[0].min_approvals, 2);
        assert_eq!(
            out.overrides[0].approver_group.as_deref(),
            Some("release-managers")
        );
    }

    #[test]
    fn required_approval_ignores_nonmatching_stage() {
        let p = policy(
            "prod-needs-two",
            PolicyRule::RequiredApproval {
                stages: vec!["Deploy".into()],
                min_approvals: 2,
                approver_group: None,
            },
        );
        let out = PolicyEngine.evaluate(&[p], &ctx("Build", Some("main"))).unwrap();
        assert!(out.overrides.is_empty());
    }

    #[test]
    fn first_denial_short_circuits() {
        let deny = policy(
            "deny-all-branches",
            PolicyRule::BranchRestriction {
                branches: vec!["**".into()],
                action: RestrictionAction::Deny,
            },
        );
        let approval = policy(
            "needs-approval",
            PolicyRule::RequiredApproval {
                stages: vec!["**".into()],
                min_approvals: 3,
                approver_group: None,
            },
        );
        let out = PolicyEngine
            .evaluate(&[deny, approval], &ctx("Deploy", Some("main")))
            .unwrap();
        assert!(!out.decision.is_allow());
        assert!(out.overrides.is_empty(), "overrides are discarded on deny");
        assert_eq!(out.audit.len(), 1, "evaluation stopped at the denial");
    }

    #[test]
    fn disabled_policies_are_skipped() {
        let mut p = policy(
            "deny-everything",
            PolicyRule::BranchRestriction {
                branches: vec!["**".into()],
                action: RestrictionAction::Deny,
            },
        );
        p.enabled = false;
        let out = PolicyEngine.evaluate(&[p], &ctx("Deploy", Some("main"))).unwrap();
        assert!(out.decision.is_allow());
        assert!(out.audit.is_empty());
    }

    #[test]
    fn audit_records_every_evaluated_policy() {
        let a = policy(
            "allow-main",
            PolicyRule::BranchRestriction {
                branches: vec!["main".into()],
                action: RestrictionAction::Allow,
            },
        );
        let b = policy(
            "needs-approval",
            PolicyRule::RequiredApproval {
                stages: vec!["Deploy".into()],
                min_approvals: 2,
                approver_group: None,
            },
        );
        let out = PolicyEngine
            .evaluate(&[a, b], &ctx("Deploy", Some("main")))
            .unwrap();
        assert_eq!(out.audit.len(), 2);
        assert_eq!(out.audit[0].result, AuditResult::Allowed);
        assert_eq!(out.audit[1].result, AuditResult::Override { min_approvals: 2 });
    }
}
