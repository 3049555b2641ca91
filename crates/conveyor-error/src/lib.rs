// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for Conveyor.
//!
//! Every core error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause, and arbitrary
//! key-value context. The taxonomy mirrors how the engine reacts: config,
//! checkout, and path errors fail a build fast; policy and approval codes
//! abort a stage; collaborator codes are logged and swallowed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid pipeline, matrix, cron, or glob definitions.
    Config,
    /// Source checkout failures.
    Checkout,
    /// Policy evaluation and denial.
    Policy,
    /// Approval gate failures, rejections, timeouts.
    Approval,
    /// Step process failures.
    Step,
    /// Cooperative cancellation.
    Cancelled,
    /// Transient collaborator failures that never change build status.
    Collaborator,
    /// Path traversal and filesystem validation.
    Path,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Checkout => "checkout",
            Self::Policy => "policy",
            Self::Approval => "approval",
            Self::Step => "step",
            Self::Cancelled => "cancelled",
            Self::Collaborator => "collaborator",
            Self::Path => "path",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that does not
/// change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Config --
    /// Pipeline structure failed validation.
    ConfigInvalidPipeline,
    /// Cron expression failed to parse.
    ConfigInvalidCron,
    /// Matrix expansion exceeded the configured ceiling.
    ConfigMatrixTooLarge,
    /// Artifact or policy glob failed to compile.
    ConfigInvalidGlob,

    /// A trigger referenced a job that does not exist.
    JobNotFound,

    // -- Checkout --
    /// The VCS collaborator reported a failure.
    CheckoutFailed,

    // -- Policy --
    /// A policy rule denied the stage.
    PolicyDenied,
    /// A policy definition is malformed.
    PolicyInvalid,

    // -- Approval --
    /// Gate creation failed; the stage fails closed.
    ApprovalGateFailed,
    /// An approver rejected the gate.
    ApprovalRejected,
    /// The gate exceeded its timeout.
    ApprovalTimedOut,

    // -- Step --
    /// Step process exited non-zero.
    StepFailed,
    /// Step process exceeded its timeout.
    StepTimedOut,
    /// Container invocation could not be constructed.
    StepContainerInvalid,

    // -- Cancelled --
    /// The build was cancelled cooperatively.
    BuildCancelled,

    // -- Collaborator --
    /// Persistence call failed.
    StoreUnavailable,
    /// Event publication timed out or dropped.
    EventPublishFailed,
    /// Notification dispatch failed.
    NotifyFailed,

    // -- Path --
    /// A resolved path escaped the workspace root.
    PathTraversal,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigInvalidPipeline
            | Self::ConfigInvalidCron
            | Self::ConfigMatrixTooLarge
            | Self::ConfigInvalidGlob
            | Self::JobNotFound => ErrorCategory::Config,

            Self::CheckoutFailed => ErrorCategory::Checkout,

            Self::PolicyDenied | Self::PolicyInvalid => ErrorCategory::Policy,

            Self::ApprovalGateFailed | Self::ApprovalRejected | Self::ApprovalTimedOut => {
                ErrorCategory::Approval
            }

            Self::StepFailed | Self::StepTimedOut | Self::StepContainerInvalid => {
                ErrorCategory::Step
            }

            Self::BuildCancelled => ErrorCategory::Cancelled,

            Self::StoreUnavailable | Self::EventPublishFailed | Self::NotifyFailed => {
                ErrorCategory::Collaborator
            }

            Self::PathTraversal => ErrorCategory::Path,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation (e.g. `"POLICY_DENIED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalidPipeline => "CONFIG_INVALID_PIPELINE",
            Self::ConfigInvalidCron => "CONFIG_INVALID_CRON",
            Self::ConfigMatrixTooLarge => "CONFIG_MATRIX_TOO_LARGE",
            Self::ConfigInvalidGlob => "CONFIG_INVALID_GLOB",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::CheckoutFailed => "CHECKOUT_FAILED",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::PolicyInvalid => "POLICY_INVALID",
            Self::ApprovalGateFailed => "APPROVAL_GATE_FAILED",
            Self::ApprovalRejected => "APPROVAL_REJECTED",
            Self::ApprovalTimedOut => "APPROVAL_TIMED_OUT",
            Self::StepFailed => "STEP_FAILED",
            Self::StepTimedOut => "STEP_TIMED_OUT",
            Self::StepContainerInvalid => "STEP_CONTAINER_INVALID",
            Self::BuildCancelled => "BUILD_CANCELLED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::EventPublishFailed => "EVENT_PUBLISH_FAILED",
            Self::NotifyFailed => "NOTIFY_FAILED",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether errors with this code must never change a build's status.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Collaborator
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Unified Conveyor error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use conveyor_error::{CoreError, ErrorCode};
///
/// let err = CoreError::new(ErrorCode::StepTimedOut, "step exceeded 300 s")
///     .with_context("stage", "Deploy")
///     .with_context("timeout_secs", 300);
/// ```
pub struct CoreError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CoreError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; entries that
    /// fail to serialise are skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CoreError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
