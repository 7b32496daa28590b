use crate::language::Language;
use crate::session::{SessionId, SessionState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    Queued {
        language: Language,
    },
    Created {
        session_id: SessionId,
        language: Language,
    },
    Provisioned {
        session_id: SessionId,
        files: usize,
    },
    Running {
        session_id: SessionId,
        steps: usize,
    },
    Finished {
        session_id: SessionId,
        state: SessionState,
        elapsed_ms: u64,
    },
    TornDown {
        session_id: SessionId,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Queued { .. } => None,
            Self::Created { session_id, .. }
            | Self::Provisioned { session_id, .. }
            | Self::Running { session_id, .. }
            | Self::Finished { session_id, .. }
            | Self::TornDown { session_id } => Some(*session_id),
        }
    }
}

pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

pub struct NoopObserver;
impl SessionObserver for NoopObserver {
    fn on_event(&self, _event: SessionEvent) {}
}
