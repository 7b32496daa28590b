//! Result reporting.
//!
//! Turns a session's terminal outcome and captured streams into the uniform
//! [`ExecutionResult`] handed back to callers.

use crate::constants::*;
use crate::session::capture::{BoundedBuffer, CaptureSnapshot};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    Completed,
    Timeout,
    ResourceLimit,
    InternalError,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::ResourceLimit => "resource-limit",
            Self::InternalError => "internal-error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which ceiling a session broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBreach {
    Memory { limit_bytes: u64 },
    Disk { limit_bytes: u64, used_bytes: u64 },
    CpuTime { limit_ms: u64 },
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory { limit_bytes } => {
                write!(f, "memory limit of {} bytes exceeded", limit_bytes)
            }
            Self::Disk {
                limit_bytes,
                used_bytes,
            } => write!(
                f,
                "disk quota of {} bytes exceeded ({} bytes used)",
                limit_bytes, used_bytes
            ),
            Self::CpuTime { limit_ms } => write!(f, "cpu time limit of {} ms exceeded", limit_ms),
        }
    }
}

/// How a session's command sequence ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Last command ran, or a build step failed with `exit_code`
    Completed { exit_code: i32, build_failed: bool },
    TimedOut { budget: Duration },
    LimitExceeded(LimitBreach),
    Errored(String),
    Cancelled,
}

/// Final, immutable output of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub termination_reason: TerminationReason,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.termination_reason == TerminationReason::Completed && self.exit_status == 0
    }
}

/// Decode a captured stream, appending the marker when bytes were dropped.
///
/// The decoded text never exceeds the buffer's cap: a character split by
/// the cap is dropped whole, and replacement characters for invalid bytes
/// are trimmed at the cap.
pub fn render_stream(buffer: &BoundedBuffer) -> String {
    let mut bytes = buffer.bytes();
    if buffer.truncated() {
        let split = bytes
            .utf8_chunks()
            .last()
            .map_or(0, |chunk| chunk.invalid().len());
        bytes = &bytes[..bytes.len() - split];
    }
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > buffer.cap() {
        let mut end = buffer.cap();
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    if buffer.truncated() {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// Normalize a terminal outcome. Returns `None` for cancelled runs, which
/// are reported to the caller as an error instead.
pub fn report(
    outcome: &RunOutcome,
    capture: &CaptureSnapshot,
    elapsed: Duration,
    session_id: Option<SessionId>,
) -> Option<ExecutionResult> {
    let (exit_status, termination_reason, message) = match outcome {
        RunOutcome::Completed {
            exit_code,
            build_failed,
        } => (
            *exit_code,
            TerminationReason::Completed,
            build_failed.then(|| "build step failed".to_string()),
        ),
        RunOutcome::TimedOut { budget } => (
            TIMEOUT_EXIT_STATUS,
            TerminationReason::Timeout,
            Some(format!(
                "wall-clock limit of {} ms exceeded",
                budget.as_millis()
            )),
        ),
        RunOutcome::LimitExceeded(breach) => (
            LIMIT_EXIT_STATUS,
            TerminationReason::ResourceLimit,
            Some(breach.to_string()),
        ),
        RunOutcome::Errored(reason) => (
            INTERNAL_ERROR_EXIT_STATUS,
            TerminationReason::InternalError,
            Some(reason.clone()),
        ),
        RunOutcome::Cancelled => return None,
    };

    Some(ExecutionResult {
        exit_status,
        stdout: render_stream(&capture.stdout),
        stderr: render_stream(&capture.stderr),
        elapsed_ms: elapsed.as_millis() as u64,
        termination_reason,
        truncated: capture.stdout.truncated() || capture.stderr.truncated(),
        message,
        session_id,
    })
}
