// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative cancellation for build execution.
//!
//! Every suspension point in a build worker's flow (checkout, cache copy,
//! approval wait, process wait, artifact copy) polls or awaits the same
//! [`CancelToken`]. Cancelling is best-effort and idempotent: the flag
//! flips once and every clone observes it.
//!
//! The token itself is `tokio-util`'s [`CancellationToken`]; this crate
//! fixes the name the rest of the workspace uses and adds the
//! domain-specific [`CancelReason`] vocabulary.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// A cloneable, cheaply-shareable token used to signal build cancellation.
///
/// All clones share the same underlying state; cancelling one immediately
/// makes every clone observe `is_cancelled() == true`, and
/// `cancelled().await` resolves for every waiter.
pub use tokio_util::sync::CancellationToken as CancelToken;

/// Why a build was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A user explicitly requested cancellation.
    UserRequested,
    /// A step or gate deadline expired.
    Timeout,
    /// A policy denied further execution.
    PolicyDenied,
    /// The server is shutting down.
    Shutdown,
}

impl CancelReason {
    /// Human-readable description of the reason.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::UserRequested => "cancelled by user request",
            Self::Timeout => "cancelled due to timeout",
            Self::PolicyDenied => "cancelled by policy",
            Self::Shutdown => "cancelled because the server is shutting down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flips_state_for_all_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_when_already_set() {
        let token = CancelToken::new();
        token.cancel();
        // Must not hang.
        token.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_future_wakes_on_signal() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[test]
    fn reasons_have_descriptions() {
        for reason in [
            CancelReason::UserRequested,
            CancelReason::Timeout,
            CancelReason::PolicyDenied,
            CancelReason::Shutdown,
        ] {
            assert!(!reason.description().is_empty());
        }
    }

    #[test]
    fn reason_serde_roundtrip() {
        let json = serde_json::to_string(&CancelReason::UserRequested).unwrap();
        assert_eq!(json, r#""user_requested""#);
        let back: CancelReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CancelReason::UserRequested);
    }
}
