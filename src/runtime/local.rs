use crate::runtime::{
    exit_code_of, pump, ExecOutcome, ResourceUsage, SandboxHandle, SandboxRuntime, SandboxSpec,
};
use crate::session::capture::{CaptureSink, Stream};
use crate::session::SessionId;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Default)]
struct LocalSlot {
    pid: Mutex<Option<u32>>,
    kill: Notify,
}

/// Runs plan steps as plain child processes of this process.
///
/// Development only: the image is ignored and the program sees the host
/// filesystem. The session working directory, wall-clock budget, output
/// cap and disk quota still apply; memory is polled from `/proc`.
pub struct LocalRuntime {
    slots: Mutex<HashMap<SessionId, Arc<LocalSlot>>>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        warn!("Local runtime selected: generated code runs WITHOUT isolation, use for development only");
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, handle: &SandboxHandle) -> Result<Arc<LocalSlot>> {
        self.slots
            .lock()
            .get(&handle.session_id)
            .cloned()
            .ok_or_else(|| anyhow!("no local sandbox for session {}", handle.session_id))
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        self.slots
            .lock()
            .insert(spec.session_id, Arc::new(LocalSlot::default()));
        Ok(SandboxHandle {
            session_id: spec.session_id,
            name: format!("local-{}", spec.session_id),
            workdir: spec.workdir.clone(),
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        capture: &CaptureSink,
    ) -> Result<ExecOutcome> {
        let slot = self.slot(handle)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&handle.workdir)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", &handle.workdir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;
        let pid = child.id();
        *slot.pid.lock() = pid;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                _ = slot.kill.notified() => {
                    if let Some(pid) = pid {
                        kill_process_group(pid).await;
                    }
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        };
        let (status, _, _) = tokio::join!(
            wait,
            pump(stdout, capture, Stream::Stdout),
            pump(stderr, capture, Stream::Stderr),
        );
        *slot.pid.lock() = None;

        Ok(ExecOutcome::exited(exit_code_of(
            status.context("Failed to wait for child")?,
        )))
    }

    async fn usage(&self, handle: &SandboxHandle) -> Result<ResourceUsage> {
        let pid = *self.slot(handle)?.pid.lock();
        Ok(pid.map(proc_usage).unwrap_or_default())
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        slot.kill.notify_one();
        let pid = *slot.pid.lock();
        if let Some(pid) = pid {
            kill_process_group(pid).await;
        }
        Ok(())
    }

    async fn destroy(&self, session_id: &SessionId) -> Result<()> {
        let slot = self.slots.lock().remove(session_id);
        if let Some(slot) = slot {
            let pid = *slot.pid.lock();
            if let Some(pid) = pid {
                debug!(pid, "Killing leftover local process group");
                kill_process_group(pid).await;
            }
        }
        Ok(())
    }

    async fn sweep(&self, keep: &HashSet<SessionId>) -> Result<Vec<SessionId>> {
        // Only slots of this process exist; stale ones lost their session.
        let stale: Vec<(SessionId, Arc<LocalSlot>)> = {
            let mut slots = self.slots.lock();
            let ids: Vec<SessionId> = slots.keys().filter(|id| !keep.contains(id)).copied().collect();
            ids.into_iter()
                .filter_map(|id| slots.remove(&id).map(|slot| (id, slot)))
                .collect()
        };
        let mut reclaimed = Vec::with_capacity(stale.len());
        for (id, slot) in stale {
            let pid = *slot.pid.lock();
            if let Some(pid) = pid {
                kill_process_group(pid).await;
            }
            reclaimed.push(id);
        }
        Ok(reclaimed)
    }

    async fn ping(&self) -> Result<String> {
        Ok(format!("local ({})", std::env::consts::OS))
    }

    async fn has_image(&self, _image: &str) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, error = %e, "Failed to signal process group");
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

/// Resident memory and CPU time of one process, read from procfs.
#[cfg(target_os = "linux")]
fn proc_usage(pid: u32) -> ResourceUsage {
    // statm and stat report pages and clock ticks; Linux defaults assumed.
    const PAGE_SIZE: u64 = 4096;
    const TICKS_PER_SEC: u64 = 100;

    let memory_bytes = std::fs::read_to_string(format!("/proc/{}/statm", pid))
        .ok()
        .and_then(|s| s.split_whitespace().nth(1)?.parse::<u64>().ok())
        .map(|pages| pages * PAGE_SIZE);

    let cpu_time_ms = std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|s| {
            // Fields after the parenthesised command name; utime and stime
            // are fields 14 and 15 of the full line.
            let rest = s.get(s.rfind(')')? + 2..)?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let utime = fields.get(11)?.parse::<u64>().ok()?;
            let stime = fields.get(12)?.parse::<u64>().ok()?;
            Some((utime + stime) * 1000 / TICKS_PER_SEC)
        });

    ResourceUsage {
        memory_bytes,
        cpu_time_ms,
    }
}

#[cfg(not(target_os = "linux"))]
fn proc_usage(_pid: u32) -> ResourceUsage {
    ResourceUsage::default()
}
