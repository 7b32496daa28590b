use crate::error::{ErrorBody, ExecError};
use crate::executor::Executor;
use crate::manager::HealthReport;
use crate::report::ExecutionResult;
use crate::request::{ExecuteBody, ExecutionRequest};
use crate::session::{SessionId, SessionInfo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Instant;

/// Language entry as listed by `GET /languages`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LanguageEntry {
    pub language: String,
    pub image: String,
}

/// HTTP client for a running `codecell serve`.
pub struct RemoteClient {
    pub endpoint: String,
    pub client: Client,
}

impl RemoteClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {} - {}", url, status, body);
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.get_json("/health").await
    }

    pub async fn languages(&self) -> Result<Vec<LanguageEntry>> {
        self.get_json("/languages").await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        self.get_json("/sessions").await
    }

    /// Ask the server to cancel a live session. False if it was not live.
    pub async fn cancel(&self, id: &SessionId) -> Result<bool> {
        let url = self.url(&format!("/sessions/{}", id));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => anyhow::bail!("{} returned {}", url, status),
        }
    }
}

#[async_trait]
impl Executor for RemoteClient {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        let url = self.url("/execute");
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&ExecuteBody::from_request(&request))
            .send()
            .await
            .map_err(|e| ExecError::Internal(format!("failed to reach {}: {}", url, e)))?;

        let status = response.status();
        crate::log_remote_operation!(
            "execute",
            status.as_u16(),
            started.elapsed().as_millis() as u64
        );

        if status.is_success() {
            return response.json::<ExecutionResult>().await.map_err(|e| {
                ExecError::Internal(format!("malformed result from {}: {}", url, e))
            });
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(body.into()),
            Err(_) => Err(ExecError::Internal(format!(
                "{} returned {} - {}",
                url, status, text
            ))),
        }
    }
}
