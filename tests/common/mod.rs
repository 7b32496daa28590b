//! Shared fixtures: a scripted in-memory sandbox runtime and config helpers.
#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use codecell::config::SandboxConfig;
use codecell::events::{SessionEvent, SessionObserver};
use codecell::manager::SessionManager;
use codecell::runtime::{
    ExecOutcome, ResourceLimits, ResourceUsage, SandboxHandle, SandboxRuntime, SandboxSpec,
};
use codecell::session::capture::{CaptureSink, Stream};
use codecell::session::{SessionId, SessionState};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const MIB: u64 = 1024 * 1024;

struct FakeBox {
    workdir: PathBuf,
    limits: ResourceLimits,
    held_memory: AtomicU64,
    kill: Notify,
}

/// Sandbox runtime that interprets the session's source file as a tiny
/// script instead of running real toolchains.
///
/// Script lines (anything else is ignored):
/// `print <text>`, `eprint <text>`, `sleep <ms>`, `alloc <mib>` (OOM kill
/// above the memory ceiling), `hold <mib>` (reported usage), `xcpu` (ends
/// on the CPU time rlimit), `spam <bytes>`,
/// `cat <file>`, `write <file> <bytes>`, `ls`, `exit <code>`.
///
/// Build steps (`g++`, `gcc`, `javac`) copy the source to the artifact and
/// fail if the source contains `COMPILE_ERROR`.
#[derive(Default)]
pub struct FakeRuntime {
    boxes: Mutex<HashMap<SessionId, Arc<FakeBox>>>,
    leftovers: Mutex<HashSet<SessionId>>,
    missing_images: Mutex<HashSet<String>>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub kills: AtomicUsize,
    pub execs: AtomicUsize,
    pub peak_live: AtomicUsize,
    pub destroy_calls: AtomicUsize,
    /// Delay after the sandbox exists but before `create` returns
    pub create_delay_ms: AtomicU64,
    /// Delay before `destroy` removes the sandbox
    pub destroy_delay_ms: AtomicU64,
    pub fail_create: AtomicBool,
    pub unreachable: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live(&self) -> usize {
        self.boxes.lock().len()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn slow_create(&self, ms: u64) {
        self.create_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn slow_destroy(&self, ms: u64) {
        self.destroy_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Pretend a previous process left this sandbox behind
    pub fn seed_leftover(&self, id: SessionId) {
        self.leftovers.lock().insert(id);
    }

    pub fn leftovers(&self) -> usize {
        self.leftovers.lock().len()
    }

    pub fn mark_missing(&self, image: &str) {
        self.missing_images.lock().insert(image.to_string());
    }

    fn sandbox(&self, handle: &SandboxHandle) -> Result<Arc<FakeBox>> {
        self.boxes
            .lock()
            .get(&handle.session_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such sandbox {}", handle.name))
    }
}

fn emit_line(capture: &CaptureSink, stream: Stream, text: &str) {
    capture.push(stream, text.as_bytes());
    capture.push(stream, b"\n");
}

fn build(workdir: &Path, argv: &[String], capture: &CaptureSink) -> Result<i32> {
    let source_name = argv.last().ok_or_else(|| anyhow!("empty build command"))?;
    let source = std::fs::read_to_string(workdir.join(source_name))?;
    if source.contains("COMPILE_ERROR") {
        emit_line(
            capture,
            Stream::Stderr,
            &format!("{}:1:1: error: COMPILE_ERROR", source_name),
        );
        return Ok(1);
    }
    let artifact = match argv[0].as_str() {
        "javac" => source_name.replace(".java", ".class"),
        _ => "main".to_string(),
    };
    std::fs::write(workdir.join(artifact), source)?;
    Ok(0)
}

fn script_for(workdir: &Path, argv: &[String]) -> Result<PathBuf> {
    let last = argv.last().ok_or_else(|| anyhow!("empty command"))?;
    let name = match argv[0].as_str() {
        "java" => format!("{}.class", last),
        _ => last.trim_start_matches("./").to_string(),
    };
    Ok(workdir.join(name))
}

async fn interpret(sandbox: &FakeBox, script: &str, capture: &CaptureSink) -> Result<ExecOutcome> {
    let done = ExecOutcome::exited;
    for line in script.lines().map(str::trim) {
        let (op, arg) = line.split_once(' ').unwrap_or((line, ""));
        match op {
            "print" => emit_line(capture, Stream::Stdout, arg),
            "eprint" => emit_line(capture, Stream::Stderr, arg),
            "sleep" => {
                let ms: u64 = arg.parse()?;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = sandbox.kill.notified() => return Ok(done(137)),
                }
            }
            "alloc" => {
                let bytes = arg.parse::<u64>()? * MIB;
                if bytes > sandbox.limits.memory_bytes {
                    return Ok(ExecOutcome {
                        oom_killed: true,
                        ..ExecOutcome::exited(137)
                    });
                }
            }
            "xcpu" => {
                return Ok(ExecOutcome {
                    cpu_time_exceeded: true,
                    ..ExecOutcome::exited(152)
                });
            }
            "hold" => {
                let bytes = arg.parse::<u64>()? * MIB;
                sandbox.held_memory.store(bytes, Ordering::SeqCst);
            }
            "spam" => {
                let mut remaining: usize = arg.parse()?;
                let chunk = [b'x'; 1024];
                while remaining > 0 {
                    let n = remaining.min(chunk.len());
                    capture.push(Stream::Stdout, &chunk[..n]);
                    remaining -= n;
                }
            }
            "cat" => {
                let contents = std::fs::read(sandbox.workdir.join(arg))?;
                capture.push(Stream::Stdout, &contents);
            }
            "write" => {
                let (name, size) = arg
                    .split_once(' ')
                    .ok_or_else(|| anyhow!("write needs a name and a size"))?;
                let size: usize = size.parse()?;
                std::fs::write(sandbox.workdir.join(name), vec![0u8; size])?;
            }
            "ls" => {
                let mut names: Vec<String> = std::fs::read_dir(&sandbox.workdir)?
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect();
                names.sort();
                for name in names {
                    emit_line(capture, Stream::Stdout, &name);
                }
            }
            "exit" => return Ok(done(arg.parse()?)),
            _ => {}
        }
    }
    Ok(done(0))
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("image {} could not be started", spec.image.reference);
        }
        let live = {
            let mut boxes = self.boxes.lock();
            boxes.insert(
                spec.session_id,
                Arc::new(FakeBox {
                    workdir: spec.workdir.clone(),
                    limits: spec.limits.clone(),
                    held_memory: AtomicU64::new(0),
                    kill: Notify::new(),
                }),
            );
            boxes.len()
        };
        self.created.fetch_add(1, Ordering::SeqCst);
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(SandboxHandle {
            session_id: spec.session_id,
            name: format!("fake-{}", spec.session_id),
            workdir: spec.workdir.clone(),
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        capture: &CaptureSink,
    ) -> Result<ExecOutcome> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let sandbox = self.sandbox(handle)?;
        match argv.first().map(String::as_str) {
            Some("g++" | "gcc" | "javac") => {
                Ok(ExecOutcome::exited(build(&sandbox.workdir, argv, capture)?))
            }
            Some(_) => {
                let script = std::fs::read_to_string(script_for(&sandbox.workdir, argv)?)?;
                interpret(&sandbox, &script, capture).await
            }
            None => bail!("empty command"),
        }
    }

    async fn usage(&self, handle: &SandboxHandle) -> Result<ResourceUsage> {
        let sandbox = self.sandbox(handle)?;
        Ok(ResourceUsage {
            memory_bytes: Some(sandbox.held_memory.load(Ordering::SeqCst)),
            cpu_time_ms: None,
        })
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.sandbox(handle)?.kill.notify_one();
        Ok(())
    }

    async fn destroy(&self, session_id: &SessionId) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.destroy_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.boxes.lock().remove(session_id).is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn sweep(&self, keep: &HashSet<SessionId>) -> Result<Vec<SessionId>> {
        let mut reclaimed: Vec<SessionId> = {
            let mut leftovers = self.leftovers.lock();
            let stale: Vec<SessionId> = leftovers.difference(keep).copied().collect();
            for id in &stale {
                leftovers.remove(id);
            }
            stale
        };
        {
            let mut boxes = self.boxes.lock();
            let stale: Vec<SessionId> = boxes
                .keys()
                .filter(|id| !keep.contains(id))
                .copied()
                .collect();
            for id in stale {
                boxes.remove(&id);
                reclaimed.push(id);
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn ping(&self) -> Result<String> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("Cannot connect to the fake daemon");
        }
        Ok("fake 1.0".to_string())
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        Ok(!self.missing_images.lock().contains(image))
    }
}

/// Records every lifecycle event in arrival order
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<SessionEvent>>,
}

impl SessionObserver for RecordingObserver {
    fn on_event(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }
}

impl RecordingObserver {
    pub fn finished_states(&self) -> Vec<SessionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Finished { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }
}

/// Small, fast limits suited to the fake runtime
pub fn test_config(work_root: &Path) -> SandboxConfig {
    SandboxConfig {
        work_root: work_root.to_path_buf(),
        max_sessions: 2,
        queue_wait_ms: 5_000,
        max_queue_depth: 16,
        default_timeout_ms: 5_000,
        max_timeout_ms: 10_000,
        max_output_bytes: 4096,
        monitor_interval_ms: 10,
        ..SandboxConfig::default()
    }
}

pub fn manager_with(config: SandboxConfig, runtime: &Arc<FakeRuntime>) -> SessionManager {
    SessionManager::new(config, runtime.clone()).expect("valid test config")
}

/// Session directories still present under the work root
pub fn session_dirs(work_root: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(work_root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("session-"))
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
