use crate::constants::*;
use crate::runtime::{
    exit_code_of, pump, ExecOutcome, SandboxHandle, SandboxRuntime, SandboxSpec,
};
use crate::session::capture::{CaptureSink, Stream};
use crate::session::SessionId;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Container sandboxes driven through the docker (or podman) CLI.
///
/// Each session gets its own container: no network, read-only root
/// filesystem, all capabilities dropped, and the session working directory
/// as the only writable mount. The container idles on `sleep infinity`
/// and every plan step runs through `exec`.
pub struct DockerRuntime {
    binary: String,
    instance: String,
}

impl DockerRuntime {
    pub fn new(binary: &str, instance: &str) -> Self {
        Self {
            binary: binary.to_string(),
            instance: instance.to_string(),
        }
    }

    fn container_name(&self, id: &SessionId) -> String {
        format!("{}-{}", self.instance, id)
    }

    fn create_args(&self, spec: &SandboxSpec) -> Vec<String> {
        let limits = &spec.limits;
        let memory = format!("{}b", limits.memory_bytes);
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            self.container_name(&spec.session_id),
            "--label".to_string(),
            format!("{}={}", INSTANCE_LABEL_KEY, self.instance),
            "--label".to_string(),
            format!("{}={}", SESSION_LABEL_KEY, spec.session_id),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--cpu-shares".to_string(),
            limits.cpu_shares.to_string(),
            "--cpus".to_string(),
            format!("{:.2}", limits.cpus),
            "--pids-limit".to_string(),
            limits.max_processes.to_string(),
            "--ulimit".to_string(),
            format!("fsize={}:{}", limits.disk_bytes, limits.disk_bytes),
        ];
        if let Some(cpu_ms) = limits.cpu_time_ms {
            // SIGXCPU at the soft limit, SIGKILL one second later
            let secs = cpu_ms.div_ceil(1000).max(1);
            args.push("--ulimit".to_string());
            args.push(format!("cpu={}:{}", secs, secs + 1));
        }
        args.extend([
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            format!("/tmp:rw,nosuid,nodev,size={}", SANDBOX_TMPFS_SIZE),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--user".to_string(),
            spec.image.user.clone(),
            "--workdir".to_string(),
            spec.image.workdir.clone(),
            "--volume".to_string(),
            format!("{}:{}:rw", spec.workdir.display(), spec.image.workdir),
            spec.image.reference.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        args
    }

    /// Run a short control command and return its trimmed stdout.
    async fn control(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.binary))?;

        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Ask the container's memory cgroup whether the OOM killer fired,
    /// falling back to the daemon's `OOMKilled` flag.
    async fn oom_confirmed(&self, name: &str) -> bool {
        for events in [CGROUP_V2_MEMORY_EVENTS, CGROUP_V1_OOM_CONTROL] {
            let args = ["exec", name, "cat", events].map(String::from);
            if let Ok(text) = self.control(&args).await {
                if let Some(count) = parse_oom_kill_count(&text) {
                    return count > 0;
                }
            }
        }
        let args = ["inspect", "--format", "{{.State.OOMKilled}}", name].map(String::from);
        match self.control(&args).await {
            Ok(flag) => flag == "true",
            Err(e) => {
                debug!(container = %name, error = %e, "OOM probe failed");
                false
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let args = ["rm", "-f", "-v", name].map(String::from);
        match self.control(&args).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let name = self.container_name(&spec.session_id);
        debug!(container = %name, image = %spec.image.reference, "Creating container sandbox");

        self.control(&self.create_args(spec))
            .await
            .context("Failed to create sandbox container")?;

        if let Err(e) = self.control(&["start".to_string(), name.clone()]).await {
            if let Err(rm) = self.remove(&name).await {
                warn!(container = %name, error = %rm, "Failed to remove container after start failure");
            }
            return Err(e.context("Failed to start sandbox container"));
        }

        Ok(SandboxHandle {
            session_id: spec.session_id,
            name,
            workdir: spec.workdir.clone(),
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        capture: &CaptureSink,
    ) -> Result<ExecOutcome> {
        let mut child = Command::new(&self.binary)
            .arg("exec")
            .arg(&handle.name)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} exec", self.binary))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, _, _) = tokio::join!(
            child.wait(),
            pump(stdout, capture, Stream::Stdout),
            pump(stderr, capture, Stream::Stderr),
        );
        let exit_code = exit_code_of(status.context("Failed to wait for exec")?);

        // A program may SIGKILL itself; only the cgroup counter proves OOM.
        let oom_killed = exit_code == LIMIT_EXIT_STATUS && self.oom_confirmed(&handle.name).await;
        Ok(ExecOutcome {
            exit_code,
            oom_killed,
            cpu_time_exceeded: exit_code == CPU_RLIMIT_EXIT_STATUS,
        })
    }

    // Memory, pid and CPU time ceilings are enforced by the container
    // cgroup and rlimits; usage is not polled here.

    async fn kill(&self, handle: &SandboxHandle) -> Result<()> {
        let args = ["kill", "--signal", "KILL", handle.name.as_str()].map(String::from);
        match self.control(&args).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("is not running") => Ok(()),
            Err(e) => Err(e),
        }
    }

    // The name is derived from the session, so a container whose create
    // call was abandoned midway is still found.
    async fn destroy(&self, session_id: &SessionId) -> Result<()> {
        self.remove(&self.container_name(session_id)).await
    }

    async fn sweep(&self, keep: &HashSet<SessionId>) -> Result<Vec<SessionId>> {
        let listing = self
            .control(&[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("label={}={}", INSTANCE_LABEL_KEY, self.instance),
                "--format".to_string(),
                format!("{{{{.Label \"{}\"}}}}", SESSION_LABEL_KEY),
            ])
            .await
            .context("Failed to list sandbox containers")?;

        let mut reclaimed = Vec::new();
        for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Ok(id) = line.parse::<SessionId>() else {
                warn!(label = line, "Skipping container with malformed session label");
                continue;
            };
            if keep.contains(&id) {
                continue;
            }
            let name = self.container_name(&id);
            match self.remove(&name).await {
                Ok(()) => reclaimed.push(id),
                Err(e) => warn!(container = %name, error = %e, "Failed to reclaim container"),
            }
        }
        Ok(reclaimed)
    }

    async fn ping(&self) -> Result<String> {
        self.control(&[
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ])
        .await
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        let status = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Failed to spawn {}", self.binary))?;
        Ok(status.success())
    }
}

const CGROUP_V2_MEMORY_EVENTS: &str = "/sys/fs/cgroup/memory.events";
const CGROUP_V1_OOM_CONTROL: &str = "/sys/fs/cgroup/memory/memory.oom_control";

/// `oom_kill <n>` line of cgroup v2 `memory.events` or v1 `memory.oom_control`
fn parse_oom_kill_count(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(' ')?;
        (key == "oom_kill").then(|| value.trim().parse().ok()).flatten()
    })
}
