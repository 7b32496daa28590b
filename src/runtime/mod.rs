//! Sandbox runtime control plane.
//!
//! A [`SandboxRuntime`] creates an isolated environment from an image,
//! runs commands inside it, and destroys it. The session drives the
//! lifecycle; the runtime only performs the mechanics.

use crate::config::{RuntimeKind, SandboxConfig};
use crate::constants::*;
use crate::registry::ImageSpec;
use crate::session::capture::{CaptureSink, Stream};
use crate::session::SessionId;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub mod docker;
pub mod local;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_shares: u64,
    pub cpus: f64,
    pub disk_bytes: u64,
    pub max_processes: u64,
    pub cpu_time_ms: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cpu_shares: DEFAULT_CPU_SHARES,
            cpus: DEFAULT_CPUS,
            disk_bytes: DEFAULT_DISK_BYTES,
            max_processes: DEFAULT_MAX_PROCESSES,
            cpu_time_ms: None,
        }
    }
}

/// Everything a runtime needs to allocate one sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub session_id: SessionId,
    pub image: ImageSpec,
    pub limits: ResourceLimits,
    /// Host directory mounted as the sandbox working directory
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub session_id: SessionId,
    /// Runtime-side name (container name for docker)
    pub name: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    /// The kernel OOM killer ended the process
    pub oom_killed: bool,
    /// The process hit the runtime's CPU time rlimit
    pub cpu_time_exceeded: bool,
}

impl ExecOutcome {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }
}

/// Live usage as far as the runtime can measure it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub memory_bytes: Option<u64>,
    pub cpu_time_ms: Option<u64>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Allocate and start a fresh sandbox; no caller data is present yet.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    /// Run one command to completion, streaming output into `capture`.
    ///
    /// The future may be dropped at any point after [`kill`](Self::kill).
    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        capture: &CaptureSink,
    ) -> Result<ExecOutcome>;

    async fn usage(&self, _handle: &SandboxHandle) -> Result<ResourceUsage> {
        Ok(ResourceUsage::default())
    }

    /// Forcefully stop whatever runs in the sandbox. Not a request to exit.
    async fn kill(&self, handle: &SandboxHandle) -> Result<()>;

    /// Reclaim the sandbox of `session_id` and every process in it.
    ///
    /// Called even when `create` never returned a handle, so it must
    /// tolerate a sandbox that is half created or does not exist.
    async fn destroy(&self, session_id: &SessionId) -> Result<()>;

    /// Destroy sandboxes of this instance whose session is not in `keep`.
    /// Returns the session ids that were reclaimed.
    async fn sweep(&self, keep: &HashSet<SessionId>) -> Result<Vec<SessionId>>;

    /// Reachability probe; returns a version or description string.
    async fn ping(&self) -> Result<String>;

    async fn has_image(&self, image: &str) -> Result<bool>;
}

pub fn build_runtime(config: &SandboxConfig) -> Arc<dyn SandboxRuntime> {
    match config.runtime {
        RuntimeKind::Docker => Arc::new(docker::DockerRuntime::new(
            &config.container_binary,
            &config.instance,
        )),
        RuntimeKind::Local => Arc::new(local::LocalRuntime::new()),
    }
}

/// Drain a child pipe into the capture sink until EOF.
pub(crate) async fn pump<R>(reader: Option<R>, capture: &CaptureSink, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => capture.push(stream, &buf[..n]),
            Err(e) => {
                tracing::debug!(error = %e, ?stream, "Output pipe closed with error");
                break;
            }
        }
    }
}

/// Exit code of a finished child; signals map to 128 + signo.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
