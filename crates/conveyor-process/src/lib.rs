// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process execution for Conveyor steps.
//!
//! [`ProcessExecutor`] is the collaborator contract; [`LocalExecutor`] is
//! the shipped implementation: spawn through `sh -c`, capture both streams,
//! honour the per-step timeout and the build's cancellation token, and mask
//! every secret value before output leaves this crate.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Secret masking for captured output.
pub mod mask;

pub use mask::mask_secrets;

use conveyor_cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period between the first kill attempt and the forced one.
const KILL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Request / output
// ---------------------------------------------------------------------------

/// What to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Command line, run through `sh -c`.
    pub command: String,
    /// Working directory.
    pub dir: PathBuf,
    /// Environment handed to the process (on top of the parent's).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Hard deadline for the process.
    pub timeout: Duration,
    /// Secret values to mask out of captured output.
    #[serde(default)]
    pub mask_values: Vec<String>,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was killed before exiting.
    pub exit_code: Option<i32>,
    /// Captured stdout, masked.
    pub stdout: String,
    /// Captured stderr, masked.
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// The timeout expired and the process was killed.
    pub timed_out: bool,
    /// The cancellation token fired and the process was killed.
    pub cancelled: bool,
}

impl ProcessOutput {
    /// `true` for a clean zero exit that was neither killed nor cancelled.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}

/// Collaborator contract for running step processes.
#[async_trait::async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run the request to completion, honouring timeout and cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error only when the process cannot be spawned at all;
    /// non-zero exits, timeouts, and cancellations are reported in the
    /// output, not as errors.
    async fn execute(
        &self,
        request: ProcessRequest,
        cancel: &CancelToken,
    ) -> anyhow::Result<ProcessOutput>;
}

// ---------------------------------------------------------------------------
// Local implementation
// ---------------------------------------------------------------------------

/// Shell-based local process executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

#[async_trait::async_trait]
impl ProcessExecutor for LocalExecutor {
    async fn execute(
        &self,
        request: ProcessRequest,
        cancel: &CancelToken,
    ) -> anyhow::Result<ProcessOutput> {
        let start = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_stream(stdout));
        let stderr_task = tokio::spawn(read_stream(stderr));

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            () = tokio::time::sleep(request.timeout) => {
                timed_out = true;
                None
            }
            () = cancel.cancelled() => {
                cancelled = true;
                None
            }
        };
        if status.is_none() {
            // The wait future is gone; the child is still ours to kill.
            kill_with_grace(&mut child).await;
        }

        let raw_stdout = stdout_task.await.unwrap_or_default();
        let raw_stderr = stderr_task.await.unwrap_or_default();

        let output = ProcessOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout: mask_secrets(&raw_stdout, &request.mask_values),
            stderr: mask_secrets(&raw_stderr, &request.mask_values),
            duration_ms: start.elapsed().as_millis() as u64,
            timed_out,
            cancelled,
        };
        debug!(
            target: "conveyor.process",
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            cancelled = output.cancelled,
            duration_ms = output.duration_ms,
            "process finished"
        );
        Ok(output)
    }
}

/// Kill the child, giving it a short grace window before the forced kill.
async fn kill_with_grace(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(target: "conveyor.process", error = %e, "failed to signal process");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!(target: "conveyor.process", "process survived grace period, forcing kill");
        let _ = child.kill().await;
    }
}

async fn read_stream(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}
