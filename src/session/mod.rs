//! Execution sessions.
//!
//! One [`ExecutionSession`] owns exactly one sandbox, one private working
//! directory and one admission slot for the lifetime of one request. It
//! walks a fixed state machine and always ends in [`SessionState::TornDown`].

pub mod cancel;
pub mod capture;
pub mod workspace;

use crate::error::ExecError;
use crate::events::{SessionEvent, SessionObserver};
use crate::language::{ExecutionPlan, Language, Phase};
use crate::metrics::SessionMetrics;
use crate::registry::ImageSpec;
use crate::report::{LimitBreach, RunOutcome};
use crate::runtime::{ResourceLimits, SandboxHandle, SandboxRuntime, SandboxSpec};
use anyhow::{anyhow, Context};
use cancel::{CancelHandle, CancelSignal};
use capture::{CaptureSink, CaptureSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;
use workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Provisioned,
    Running,
    Completed,
    TimedOut,
    LimitExceeded,
    Errored,
    Cancelled,
    TornDown,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::LimitExceeded | Self::Errored | Self::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Provisioned) | (Provisioned, Running) => true,
            (Running, Completed | TimedOut | LimitExceeded) => true,
            (Created | Provisioned | Running, Errored | Cancelled) => true,
            (from, TornDown) => from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Provisioned => "provisioned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::LimitExceeded => "limit_exceeded",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
            Self::TornDown => "torn_down",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&RunOutcome> for SessionState {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed { .. } => Self::Completed,
            RunOutcome::TimedOut { .. } => Self::TimedOut,
            RunOutcome::LimitExceeded(_) => Self::LimitExceeded,
            RunOutcome::Errored(_) => Self::Errored,
            RunOutcome::Cancelled => Self::Cancelled,
        }
    }
}

/// Public view of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub language: Language,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

struct LiveEntry {
    language: Language,
    state: SessionState,
    created_at: DateTime<Utc>,
    cancel: CancelHandle,
}

/// Sessions that hold a slot and have not been torn down yet.
#[derive(Default)]
pub struct LiveSessions {
    entries: Mutex<HashMap<SessionId, LiveEntry>>,
}

impl LiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: SessionId, language: Language, cancel: CancelHandle) {
        self.entries.lock().insert(
            id,
            LiveEntry {
                language,
                state: SessionState::Created,
                created_at: Utc::now(),
                cancel,
            },
        );
    }

    fn set_state(&self, id: &SessionId, state: SessionState) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.state = state;
        }
    }

    fn remove(&self, id: &SessionId) {
        self.entries.lock().remove(id);
    }

    /// Trip the cancel switch of a live session. False if unknown.
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.entries.lock().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> HashSet<SessionId> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                language: entry.language,
                state: entry.state,
                created_at: entry.created_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }
}

/// Collaborators shared by every session of one manager
pub(crate) struct SessionContext {
    pub runtime: Arc<dyn SandboxRuntime>,
    pub live: Arc<LiveSessions>,
    pub observer: Arc<dyn SessionObserver>,
    pub metrics: Arc<SessionMetrics>,
    pub work_root: PathBuf,
    pub limits: ResourceLimits,
    pub max_output_bytes: usize,
    pub monitor_interval: Duration,
}

pub struct ExecutionSession {
    id: SessionId,
    language: Language,
    image: ImageSpec,
    state: SessionState,
    workspace: Option<Workspace>,
    handle: Option<SandboxHandle>,
    /// Set once `create` has been called, whether or not it returned
    sandbox_requested: bool,
    capture: CaptureSink,
    started: Option<Instant>,
    slot: Option<OwnedSemaphorePermit>,
    ctx: Arc<SessionContext>,
}

impl ExecutionSession {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        language: Language,
        image: ImageSpec,
        slot: OwnedSemaphorePermit,
        cancel: CancelHandle,
    ) -> Self {
        let id = SessionId::new();
        ctx.live.insert(id, language, cancel);
        ctx.metrics.session_created();
        ctx.observer.on_event(SessionEvent::Created {
            session_id: id,
            language,
        });
        crate::log_session_start!(id, language);

        Self {
            id,
            language,
            image,
            state: SessionState::Created,
            workspace: None,
            handle: None,
            sandbox_requested: false,
            capture: CaptureSink::new(ctx.max_output_bytes),
            started: None,
            slot: Some(slot),
            ctx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capture(&self) -> CaptureSnapshot {
        self.capture.snapshot()
    }

    /// Wall-clock time since the session entered `Running`
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn transition(&mut self, next: SessionState) -> Result<(), ExecError> {
        if !self.state.can_transition_to(next) {
            return Err(ExecError::Internal(format!(
                "illegal session transition {} -> {}",
                self.state, next
            )));
        }
        debug!(session_id = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        self.ctx.live.set_state(&self.id, next);
        Ok(())
    }

    /// Allocate the private working directory and the runtime sandbox.
    pub async fn allocate(&mut self) -> anyhow::Result<()> {
        if self.state != SessionState::Created || self.handle.is_some() {
            return Err(anyhow!("session {} already allocated", self.id));
        }
        let workspace = Workspace::create(&self.ctx.work_root, &self.id)?;
        let spec = SandboxSpec {
            session_id: self.id,
            image: self.image.clone(),
            limits: self.ctx.limits.clone(),
            workdir: workspace.path().to_path_buf(),
        };
        self.workspace = Some(workspace);

        self.sandbox_requested = true;
        let handle = self
            .ctx
            .runtime
            .create(&spec)
            .await
            .with_context(|| format!("Failed to create sandbox from {}", self.image.reference))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Write every planned file into the working directory.
    pub fn provision(&mut self, plan: &ExecutionPlan) -> anyhow::Result<()> {
        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| anyhow!("session {} has no working directory", self.id))?;
        for file in &plan.files {
            workspace.write_file(&file.name, &file.contents)?;
        }
        self.transition(SessionState::Provisioned)?;
        self.ctx.observer.on_event(SessionEvent::Provisioned {
            session_id: self.id,
            files: plan.files.len(),
        });
        Ok(())
    }

    /// Run the plan's steps in order under one wall-clock budget.
    pub async fn run(
        &mut self,
        plan: &ExecutionPlan,
        budget: Duration,
        cancel: &mut CancelSignal,
    ) -> RunOutcome {
        let Some(handle) = self.handle.clone() else {
            return RunOutcome::Errored("sandbox not allocated".to_string());
        };
        if let Err(e) = self.transition(SessionState::Running) {
            return RunOutcome::Errored(e.to_string());
        }
        let started = Instant::now();
        self.started = Some(started);
        let deadline = tokio::time::Instant::from_std(started) + budget;
        self.ctx.observer.on_event(SessionEvent::Running {
            session_id: self.id,
            steps: plan.steps.len(),
        });

        let mut exit_code = 0;
        for step in &plan.steps {
            debug!(session_id = %self.id, argv = ?step.argv, "Running step");
            match self.run_step(&handle, &step.argv, deadline, budget, cancel).await {
                Ok(code) if step.phase == Phase::Build && code != 0 => {
                    return RunOutcome::Completed {
                        exit_code: code,
                        build_failed: true,
                    };
                }
                Ok(code) => exit_code = code,
                Err(stopped) => return stopped,
            }
        }
        RunOutcome::Completed {
            exit_code,
            build_failed: false,
        }
    }

    async fn run_step(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        deadline: tokio::time::Instant,
        budget: Duration,
        cancel: &mut CancelSignal,
    ) -> Result<i32, RunOutcome> {
        let exec = self.ctx.runtime.exec(handle, argv, &self.capture);
        tokio::pin!(exec);

        let mut monitor = tokio::time::interval(self.ctx.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.kill(handle).await;
                    return Err(RunOutcome::Cancelled);
                }
                result = &mut exec => {
                    return match result {
                        Ok(outcome) if outcome.oom_killed => Err(RunOutcome::LimitExceeded(
                            LimitBreach::Memory {
                                limit_bytes: self.ctx.limits.memory_bytes,
                            },
                        )),
                        Ok(outcome) => match self.ctx.limits.cpu_time_ms {
                            Some(limit_ms) if outcome.cpu_time_exceeded => {
                                Err(RunOutcome::LimitExceeded(LimitBreach::CpuTime { limit_ms }))
                            }
                            _ => Ok(outcome.exit_code),
                        },
                        Err(e) => Err(RunOutcome::Errored(format!("command failed to run: {:#}", e))),
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.kill(handle).await;
                    return Err(RunOutcome::TimedOut { budget });
                }
                _ = monitor.tick() => {
                    if let Some(breach) = self.check_limits(handle).await {
                        self.kill(handle).await;
                        return Err(RunOutcome::LimitExceeded(breach));
                    }
                }
            }
        }
    }

    async fn kill(&self, handle: &SandboxHandle) {
        if let Err(e) = self.ctx.runtime.kill(handle).await {
            warn!(session_id = %self.id, error = %e, "Failed to kill sandboxed process");
        }
    }

    async fn check_limits(&self, handle: &SandboxHandle) -> Option<LimitBreach> {
        let limits = &self.ctx.limits;
        if let Some(workspace) = &self.workspace {
            let used = workspace.disk_usage();
            if used > limits.disk_bytes {
                return Some(LimitBreach::Disk {
                    limit_bytes: limits.disk_bytes,
                    used_bytes: used,
                });
            }
        }

        let usage = match self.ctx.runtime.usage(handle).await {
            Ok(usage) => usage,
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "Usage probe failed");
                return None;
            }
        };
        if usage.memory_bytes.is_some_and(|m| m > limits.memory_bytes) {
            return Some(LimitBreach::Memory {
                limit_bytes: limits.memory_bytes,
            });
        }
        if let (Some(limit_ms), Some(used_ms)) = (limits.cpu_time_ms, usage.cpu_time_ms) {
            if used_ms > limit_ms {
                return Some(LimitBreach::CpuTime { limit_ms });
            }
        }
        None
    }

    /// Allocate, provision and run, recording the terminal state.
    pub async fn drive(
        &mut self,
        plan: &ExecutionPlan,
        budget: Duration,
        cancel: &mut CancelSignal,
    ) -> RunOutcome {
        let outcome = self.drive_steps(plan, budget, cancel).await;
        let terminal = SessionState::from(&outcome);
        if let Err(e) = self.transition(terminal) {
            warn!(session_id = %self.id, error = %e, "Dropping terminal transition");
        }
        let elapsed_ms = self.elapsed().as_millis() as u64;
        self.ctx.observer.on_event(SessionEvent::Finished {
            session_id: self.id,
            state: self.state,
            elapsed_ms,
        });
        crate::log_session_finish!(self.id, self.state, elapsed_ms);
        outcome
    }

    async fn drive_steps(
        &mut self,
        plan: &ExecutionPlan,
        budget: Duration,
        cancel: &mut CancelSignal,
    ) -> RunOutcome {
        if let Err(e) = self.allocate().await {
            return RunOutcome::Errored(format!("sandbox allocation failed: {:#}", e));
        }
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        if let Err(e) = self.provision(plan) {
            return RunOutcome::Errored(format!("provisioning failed: {:#}", e));
        }
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        self.run(plan, budget, cancel).await
    }

    /// Destroy the sandbox, remove the working directory and release the slot.
    ///
    /// Reclamation runs as its own task, so dropping this future midway
    /// does not stop it.
    pub async fn teardown(mut self) {
        if !self.state.is_terminal() && self.state != SessionState::TornDown {
            let _ = self.transition(SessionState::Errored);
        }
        if self.transition(SessionState::TornDown).is_err() {
            return;
        }
        let id = self.id;
        if let Err(e) = tokio::spawn(self.reclaim().run()).await {
            warn!(session_id = %id, error = %e, "Teardown task failed");
        }
    }

    fn reclaim(&mut self) -> Reclaim {
        self.handle = None;
        Reclaim {
            id: self.id,
            sandbox: std::mem::take(&mut self.sandbox_requested),
            workspace: self.workspace.take(),
            slot: self.slot.take(),
            ctx: self.ctx.clone(),
        }
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        self.state = SessionState::TornDown;
        let reclaim = self.reclaim();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!(session_id = %self.id, "Session dropped before teardown, reclaiming in background");
                rt.spawn(reclaim.run());
            }
            Err(_) => {
                warn!(session_id = %self.id, "Session dropped outside the async runtime; sandbox left for the recovery sweep");
                reclaim.finish();
            }
        }
    }
}

/// Resources a session still holds at teardown
struct Reclaim {
    id: SessionId,
    sandbox: bool,
    workspace: Option<Workspace>,
    slot: Option<OwnedSemaphorePermit>,
    ctx: Arc<SessionContext>,
}

impl Reclaim {
    async fn run(self) {
        if self.sandbox {
            if let Err(e) = self.ctx.runtime.destroy(&self.id).await {
                warn!(session_id = %self.id, error = %e, "Failed to destroy sandbox");
            }
        }
        self.finish();
    }

    fn finish(mut self) {
        if let Some(workspace) = self.workspace.take() {
            if let Err(e) = workspace.remove() {
                warn!(session_id = %self.id, error = %e, "Failed to remove working directory");
            }
        }
        self.ctx.live.remove(&self.id);
        drop(self.slot.take());
        self.ctx.metrics.session_torn_down();
        self.ctx
            .observer
            .on_event(SessionEvent::TornDown { session_id: self.id });
        crate::log_teardown!(self.id);
    }
}
