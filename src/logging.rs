use std::io;
/// Structured logging for codecell
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("codecell=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        // JSON output for log aggregation
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

#[macro_export]
macro_rules! log_session_start {
    ($session_id:expr, $language:expr) => {
        tracing::info!(
            session_id = %$session_id,
            language = %$language,
            "Session started"
        );
    };
}

#[macro_export]
macro_rules! log_session_finish {
    ($session_id:expr, $state:expr, $elapsed_ms:expr) => {
        tracing::info!(
            session_id = %$session_id,
            state = %$state,
            elapsed_ms = $elapsed_ms,
            "Session finished"
        );
    };
}

#[macro_export]
macro_rules! log_teardown {
    ($session_id:expr) => {
        tracing::debug!(session_id = %$session_id, "Session torn down");
    };
}

#[macro_export]
macro_rules! log_rejected {
    ($kind:expr, $message:expr) => {
        tracing::warn!(kind = $kind, message = %$message, "Request rejected");
    };
}

#[macro_export]
macro_rules! log_remote_operation {
    ($operation:expr, $status:expr, $duration_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            status = $status,
            duration_ms = $duration_ms,
            "Remote operation completed"
        );
    };
}
