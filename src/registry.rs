//! Sandbox image registry.
//!
//! Maps each enabled [`Language`] to a pre-built image that carries only
//! that language's toolchain and runs as a fixed non-root user.

use crate::error::ExecError;
use crate::language::Language;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Non-root uid:gid every sandbox image runs as
pub const SANDBOX_USER: &str = "1000:1000";

/// Working directory inside the sandbox; the only writable mount
pub const SANDBOX_WORKDIR: &str = "/app";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub reference: String,
    pub user: String,
    pub workdir: String,
}

impl ImageSpec {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            user: SANDBOX_USER.to_string(),
            workdir: SANDBOX_WORKDIR.to_string(),
        }
    }
}

/// Default image reference for a language
pub fn default_image(language: Language) -> &'static str {
    match language {
        Language::Python => "stellar-python-sandbox:3.12",
        Language::Cpp | Language::C => "stellar-cpp-sandbox:latest",
        Language::Java => "stellar-java-sandbox:latest",
        Language::Javascript => "stellar-node-sandbox:20",
        Language::Shell => "stellar-shell-sandbox:latest",
    }
}

/// Upstream toolchain image a sandbox image is built from
fn base_image(language: Language) -> &'static str {
    match language {
        Language::Python => "python:3.12-slim",
        Language::Cpp | Language::C => "gcc:latest",
        Language::Java => "openjdk:17-jdk-slim",
        Language::Javascript => "node:20-slim",
        Language::Shell => "debian:bookworm-slim",
    }
}

/// Render the minimal image definition for a language.
pub fn dockerfile(language: Language) -> String {
    format!(
        "FROM {base}\n\
         \n\
         WORKDIR {workdir}\n\
         \n\
         # Create a non-root user\n\
         RUN id -u 1000 >/dev/null 2>&1 || useradd -m -u 1000 runner\n\
         \n\
         USER {user}\n\
         \n\
         CMD [\"sleep\", \"infinity\"]\n",
        base = base_image(language),
        workdir = SANDBOX_WORKDIR,
        user = SANDBOX_USER,
    )
}

/// Read-only after construction; shared freely across sessions.
#[derive(Debug, Clone)]
pub struct ImageRegistry {
    images: BTreeMap<Language, ImageSpec>,
}

impl ImageRegistry {
    pub fn new(images: BTreeMap<Language, ImageSpec>) -> Self {
        Self { images }
    }

    /// Default images for `enabled`, with reference overrides applied.
    pub fn with_overrides(enabled: &[Language], overrides: &HashMap<Language, String>) -> Self {
        let images = enabled
            .iter()
            .map(|&language| {
                let reference = overrides
                    .get(&language)
                    .cloned()
                    .unwrap_or_else(|| default_image(language).to_string());
                (language, ImageSpec::new(reference))
            })
            .collect();
        Self { images }
    }

    pub fn resolve(&self, language: Language) -> Result<&ImageSpec, ExecError> {
        self.images
            .get(&language)
            .ok_or_else(|| ExecError::UnknownLanguage(language.to_string()))
    }

    pub fn resolve_name(&self, language: &str) -> Result<(Language, &ImageSpec), ExecError> {
        let language: Language = language.parse()?;
        Ok((language, self.resolve(language)?))
    }

    pub fn languages(&self) -> impl Iterator<Item = (Language, &ImageSpec)> + '_ {
        self.images.iter().map(|(l, spec)| (*l, spec))
    }
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self::with_overrides(&Language::ALL, &HashMap::new())
    }
}
