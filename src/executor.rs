use crate::error::{calculate_backoff, is_retryable, ExecError, RetryConfig};
use crate::manager::SessionManager;
use crate::report::ExecutionResult;
use crate::request::ExecutionRequest;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Anything that turns a request into a result: the in-process manager or
/// a remote server.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError>;
}

#[async_trait]
impl Executor for SessionManager {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        SessionManager::execute(self, request).await
    }
}

/// Run `request`, backing off and retrying while the executor is overloaded.
///
/// Every other error, and the last `Overloaded` once attempts run out, is
/// returned as is.
pub async fn execute_with_retry<E>(
    executor: &E,
    request: ExecutionRequest,
    config: &RetryConfig,
) -> Result<ExecutionResult, ExecError>
where
    E: Executor + ?Sized,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match executor.execute(request.clone()).await {
            Err(e) if is_retryable(&e) && attempt + 1 < attempts => {
                let backoff = calculate_backoff(attempt, config);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    backoff_ms = backoff,
                    error = %e,
                    "Executor overloaded, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
