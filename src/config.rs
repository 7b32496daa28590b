use crate::constants::*;
use crate::language::Language;
use crate::registry::ImageRegistry;
use crate::runtime::ResourceLimits;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Container CLI (docker or podman)
    Docker,
    /// Plain child processes; development only, no isolation
    Local,
}

/// Execution core configuration. Every field has a default so partial
/// JSON files are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub runtime: RuntimeKind,
    /// Container CLI binary for the docker runtime
    pub container_binary: String,
    /// Label value identifying sandboxes owned by this instance
    pub instance: String,
    /// Host directory holding per-session working directories
    pub work_root: PathBuf,
    pub max_sessions: usize,
    pub queue_wait_ms: u64,
    pub max_queue_depth: usize,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub limits: ResourceLimits,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
    pub monitor_interval_ms: u64,
    /// Image reference overrides per language
    pub images: HashMap<Language, String>,
    /// Languages accepted by this instance; all when absent
    pub languages: Option<Vec<Language>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Docker,
            container_binary: "docker".to_string(),
            instance: "codecell".to_string(),
            work_root: std::env::temp_dir().join("codecell"),
            max_sessions: DEFAULT_MAX_SESSIONS,
            queue_wait_ms: DEFAULT_QUEUE_WAIT_MS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            limits: ResourceLimits::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            images: HashMap::new(),
            languages: None,
        }
    }
}

impl SandboxConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            bail!("max_sessions must be at least 1");
        }
        if self.default_timeout_ms == 0 || self.max_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            bail!(
                "default_timeout_ms ({}) exceeds max_timeout_ms ({})",
                self.default_timeout_ms,
                self.max_timeout_ms
            );
        }
        if self.max_output_bytes == 0 {
            bail!("max_output_bytes must be greater than zero");
        }
        if self.monitor_interval_ms == 0 {
            bail!("monitor_interval_ms must be greater than zero");
        }
        if self.limits.memory_bytes == 0 || self.limits.disk_bytes == 0 {
            bail!("memory and disk ceilings must be greater than zero");
        }
        if self.instance.is_empty()
            || !self
                .instance
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            bail!("instance '{}' is not a valid label value", self.instance);
        }
        if self.runtime == RuntimeKind::Docker && !self.work_root.is_absolute() {
            bail!(
                "work_root {} must be absolute to be mounted into containers",
                self.work_root.display()
            );
        }
        if matches!(&self.languages, Some(l) if l.is_empty()) {
            bail!("at least one language must be enabled");
        }
        Ok(())
    }

    pub fn enabled_languages(&self) -> Vec<Language> {
        self.languages
            .clone()
            .unwrap_or_else(|| Language::ALL.to_vec())
    }

    pub fn registry(&self) -> ImageRegistry {
        ImageRegistry::with_overrides(&self.enabled_languages(), &self.images)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
