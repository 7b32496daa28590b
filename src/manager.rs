//! Session manager: admission control and the public execution entry point.

use crate::config::SandboxConfig;
use crate::error::ExecError;
use crate::events::{NoopObserver, SessionEvent, SessionObserver};
use crate::language::Language;
use crate::metrics::SessionMetrics;
use crate::registry::ImageRegistry;
use crate::report::{report, ExecutionResult};
use crate::request::ExecutionRequest;
use crate::runtime::SandboxRuntime;
use crate::session::cancel::{CancelHandle, CancelSignal};
use crate::session::{workspace, ExecutionSession, LiveSessions, SessionContext, SessionId, SessionInfo};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

/// Result of a crash-recovery sweep
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub containers: Vec<SessionId>,
    pub directories: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.directories.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    pub language: Language,
    pub image: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_error: Option<String>,
    pub images: Vec<ImageStatus>,
    pub live_sessions: usize,
    pub max_sessions: usize,
}

/// Owns the slot pool and runs every request in a fresh session.
///
/// Cheap to clone; clones share the pool, the live-session table and the
/// metrics.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SandboxConfig,
    registry: ImageRegistry,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
    ctx: Arc<SessionContext>,
}

/// Holds a place in the admission queue; leaves it on drop.
struct QueuePlace<'a> {
    inner: &'a Inner,
}

impl<'a> QueuePlace<'a> {
    fn enter(inner: &'a Inner) -> Result<Self, ExecError> {
        let ahead = inner.waiting.fetch_add(1, Ordering::SeqCst);
        if ahead >= inner.config.max_queue_depth {
            inner.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecError::Overloaded {
                waited_ms: 0,
                queued: ahead,
            });
        }
        inner.ctx.metrics.queue_entered();
        Ok(Self { inner })
    }
}

impl Drop for QueuePlace<'_> {
    fn drop(&mut self) {
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        self.inner.ctx.metrics.queue_left();
    }
}

impl SessionManager {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn SandboxRuntime>) -> anyhow::Result<Self> {
        Self::with_observer(config, runtime, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: SandboxConfig,
        runtime: Arc<dyn SandboxRuntime>,
        observer: Arc<dyn SessionObserver>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = config.registry();
        let ctx = Arc::new(SessionContext {
            runtime,
            live: Arc::new(LiveSessions::new()),
            observer,
            metrics: Arc::new(SessionMetrics::new()),
            work_root: config.work_root.clone(),
            limits: config.limits.clone(),
            max_output_bytes: config.max_output_bytes,
            monitor_interval: config.monitor_interval(),
        });
        info!(
            runtime = ctx.runtime.kind(),
            max_sessions = config.max_sessions,
            work_root = %config.work_root.display(),
            "Session manager ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_sessions)),
                waiting: AtomicUsize::new(0),
                registry,
                config,
                ctx,
            }),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.inner.ctx.metrics
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.inner.ctx.runtime
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        self.execute_with_cancel(request, CancelHandle::new()).await
    }

    /// Run one request; tripping `cancel` at any point ends it with
    /// [`ExecError::Cancelled`] after the sandbox is reclaimed.
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancelHandle,
    ) -> Result<ExecutionResult, ExecError> {
        let result = self.run_request(request, cancel).await;
        if let Err(e) = &result {
            self.inner.ctx.metrics.rejected(e.kind());
            if e.is_caller_error() {
                debug!(kind = e.kind(), error = %e, "Request rejected");
            } else {
                crate::log_rejected!(e.kind(), e);
            }
        }
        result
    }

    async fn run_request(
        &self,
        request: ExecutionRequest,
        cancel: CancelHandle,
    ) -> Result<ExecutionResult, ExecError> {
        let inner = &self.inner;
        let config = &inner.config;
        let language = request.language();

        let image = inner.registry.resolve(language)?.clone();
        if request.source().len() > config.max_source_bytes {
            return Err(ExecError::InvalidSource(format!(
                "source is {} bytes, limit is {}",
                request.source().len(),
                config.max_source_bytes
            )));
        }
        if let Some(input) = request.input() {
            if input.bytes.len() > config.max_input_bytes {
                return Err(ExecError::InvalidRequest(format!(
                    "input file is {} bytes, limit is {}",
                    input.bytes.len(),
                    config.max_input_bytes
                )));
            }
        }
        let plan = language.adapter().plan(request.source(), request.input())?;
        let budget = request.effective_timeout(config.default_timeout(), config.max_timeout())?;

        let mut signal = cancel.signal();
        if signal.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let slot = self.admit(language, &mut signal).await?;

        let mut session =
            ExecutionSession::new(inner.ctx.clone(), language, image, slot, cancel);
        let outcome = session.drive(&plan, budget, &mut signal).await;
        let result = report(
            &outcome,
            &session.capture(),
            session.elapsed(),
            Some(session.id()),
        );
        let elapsed_ms = session.elapsed().as_millis() as u64;
        let label = result
            .as_ref()
            .map(|r| r.termination_reason.as_str())
            .unwrap_or("cancelled");
        inner.ctx.metrics.session_finished(label, elapsed_ms);

        session.teardown().await;
        result.ok_or(ExecError::Cancelled)
    }

    /// Wait for a free slot, FIFO, for at most the queue-wait budget.
    async fn admit(
        &self,
        language: Language,
        signal: &mut CancelSignal,
    ) -> Result<OwnedSemaphorePermit, ExecError> {
        let inner = &self.inner;
        match inner.slots.clone().try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => {
                return Err(ExecError::Internal("slot pool closed".to_string()))
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let _place = QueuePlace::enter(inner)?;
        inner.ctx.observer.on_event(SessionEvent::Queued { language });
        let started = Instant::now();
        let acquire = tokio::time::timeout(
            inner.config.queue_wait(),
            inner.slots.clone().acquire_owned(),
        );

        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(ExecError::Cancelled),
            acquired = acquire => match acquired {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(ExecError::Internal("slot pool closed".to_string())),
                Err(_) => Err(ExecError::Overloaded {
                    waited_ms: started.elapsed().as_millis() as u64,
                    queued: inner.waiting.load(Ordering::SeqCst).saturating_sub(1),
                }),
            },
        }
    }

    /// Cancel a live session by id. False if no such session is live.
    pub fn cancel(&self, id: &SessionId) -> bool {
        self.inner.ctx.live.cancel(id)
    }

    pub fn live_sessions(&self) -> Vec<SessionInfo> {
        self.inner.ctx.live.snapshot()
    }

    pub fn live_count(&self) -> usize {
        self.inner.ctx.live.len()
    }

    /// Callers currently waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Sandboxes allocated since start
    pub fn sessions_created(&self) -> u64 {
        self.inner.ctx.metrics.snapshot().created
    }

    /// Reclaim sandboxes and working directories that no live session owns.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        let ctx = &self.inner.ctx;
        let live = ctx.live.ids();
        let containers = ctx.runtime.sweep(&live).await?;
        let directories = workspace::sweep_stale(&ctx.work_root, &live)?;
        let report = RecoveryReport {
            containers,
            directories,
        };
        if report.is_empty() {
            debug!("Recovery sweep found nothing to reclaim");
        } else {
            info!(
                containers = report.containers.len(),
                directories = report.directories.len(),
                "Recovery sweep reclaimed leftovers"
            );
        }
        Ok(report)
    }

    /// Runtime reachability and image availability per enabled language.
    pub async fn health(&self) -> HealthReport {
        let runtime = &self.inner.ctx.runtime;
        let (runtime_version, runtime_error) = match runtime.ping().await {
            Ok(version) => (Some(version), None),
            Err(e) => (None, Some(format!("{:#}", e))),
        };

        let reachable = runtime_error.is_none();
        let probes = self
            .inner
            .registry
            .languages()
            .map(|(language, spec)| async move {
                let available = reachable
                    && match runtime.has_image(&spec.reference).await {
                        Ok(found) => found,
                        Err(e) => {
                            warn!(image = %spec.reference, error = %e, "Image probe failed");
                            false
                        }
                    };
                ImageStatus {
                    language,
                    image: spec.reference.clone(),
                    available,
                }
            });
        let images = join_all(probes).await;

        HealthReport {
            healthy: runtime_error.is_none() && images.iter().all(|i| i.available),
            runtime: runtime.kind().to_string(),
            runtime_version,
            runtime_error,
            images,
            live_sessions: self.live_count(),
            max_sessions: self.inner.config.max_sessions,
        }
    }
}
