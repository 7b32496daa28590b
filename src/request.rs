use crate::error::ExecError;
use crate::language::Language;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Data file made available next to the source inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// One submission: immutable once built, owned by the manager while it runs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    language: Language,
    source: String,
    input: Option<InputFile>,
    timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Self {
            language,
            source: source.into(),
            input: None,
            timeout: None,
        }
    }

    /// Build a request from a caller-supplied language identifier.
    pub fn parse(language: &str, source: impl Into<String>) -> Result<Self, ExecError> {
        Ok(Self::new(language.parse()?, source))
    }

    pub fn with_input(mut self, input: InputFile) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn input(&self) -> Option<&InputFile> {
        self.input.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Effective wall-clock budget: the override may lower the budget but
    /// never raise it past `ceiling`.
    pub fn effective_timeout(
        &self,
        default: Duration,
        ceiling: Duration,
    ) -> Result<Duration, ExecError> {
        match self.timeout {
            Some(t) if t.is_zero() => Err(ExecError::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            )),
            Some(t) => Ok(t.min(ceiling)),
            None => Ok(default.min(ceiling)),
        }
    }
}

/// JSON body of `POST /execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    pub language: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<InputFileBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFileBody {
    pub name: String,
    pub content_base64: String,
}

impl ExecuteBody {
    pub fn from_request(request: &ExecutionRequest) -> Self {
        Self {
            language: request.language().to_string(),
            source: request.source().to_string(),
            input_file: request.input().map(|input| InputFileBody {
                name: input.name.clone(),
                content_base64: base64::engine::general_purpose::STANDARD.encode(&input.bytes),
            }),
            timeout_ms: request.timeout().map(|t| t.as_millis() as u64),
        }
    }
}

impl TryFrom<ExecuteBody> for ExecutionRequest {
    type Error = ExecError;

    fn try_from(body: ExecuteBody) -> Result<Self, Self::Error> {
        let mut request = ExecutionRequest::parse(&body.language, body.source)?;
        if let Some(file) = body.input_file {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(file.content_base64.as_bytes())
                .map_err(|e| {
                    ExecError::InvalidRequest(format!("input file is not valid base64: {}", e))
                })?;
            request = request.with_input(InputFile::new(file.name, bytes));
        }
        if let Some(ms) = body.timeout_ms {
            request = request.with_timeout_ms(ms);
        }
        Ok(request)
    }
}
