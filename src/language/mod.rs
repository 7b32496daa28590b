//! Language adapters.
//!
//! Each supported language is one variant of [`Language`]. The variant picks
//! a stateless [`LanguageAdapter`] that turns source text into an
//! [`ExecutionPlan`]: the files to inject and the ordered commands to run
//! inside the sandbox working directory.

pub mod java;
pub mod javascript;
pub mod native;
pub mod python;
pub mod shell;

use crate::error::ExecError;
use crate::request::InputFile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest accepted file name inside a sandbox working directory
const MAX_FILE_NAME_BYTES: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
    C,
    Java,
    Javascript,
    Shell,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::Cpp,
        Language::C,
        Language::Java,
        Language::Javascript,
        Language::Shell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Cpp => "cpp",
            Self::C => "c",
            Self::Java => "java",
            Self::Javascript => "javascript",
            Self::Shell => "shell",
        }
    }

    pub fn adapter(&self) -> &'static dyn LanguageAdapter {
        static PYTHON: python::PythonAdapter = python::PythonAdapter;
        static CPP: native::NativeAdapter = native::NativeAdapter::CPP;
        static C: native::NativeAdapter = native::NativeAdapter::C;
        static JAVA: java::JavaAdapter = java::JavaAdapter;
        static JAVASCRIPT: javascript::JavascriptAdapter = javascript::JavascriptAdapter;
        static SHELL: shell::ShellAdapter = shell::ShellAdapter;

        match self {
            Self::Python => &PYTHON,
            Self::Cpp => &CPP,
            Self::C => &C,
            Self::Java => &JAVA,
            Self::Javascript => &JAVASCRIPT,
            Self::Shell => &SHELL,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Python),
            "cpp" | "c++" | "cxx" | "cc" => Ok(Self::Cpp),
            "c" => Ok(Self::C),
            "java" => Ok(Self::Java),
            "javascript" | "js" | "node" => Ok(Self::Javascript),
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            _ => Err(ExecError::UnknownLanguage(s.to_string())),
        }
    }
}

/// Stage a command belongs to; a failing build stops the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Build,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub phase: Phase,
    pub argv: Vec<String>,
}

impl CommandStep {
    pub fn build<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phase: Phase::Build,
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn run<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phase: Phase::Run,
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Files to write and commands to run for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub language: Language,
    pub files: Vec<PlannedFile>,
    pub steps: Vec<CommandStep>,
}

impl ExecutionPlan {
    pub fn entry_file(&self) -> &str {
        self.files.first().map(|f| f.name.as_str()).unwrap_or_default()
    }
}

/// Contract every language strategy implements.
///
/// Implementations are stateless and shared across sessions; only
/// [`source_file`](Self::source_file) and [`steps`](Self::steps) vary.
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> Language;

    /// File name the source is written to
    fn source_file(&self, source: &str) -> String;

    /// Ordered command sequence, relative to the working directory
    fn steps(&self, source_file: &str) -> Vec<CommandStep>;

    /// Names produced by the build that an input file must not shadow
    fn is_build_artifact(&self, _name: &str) -> bool {
        false
    }

    fn plan(&self, source: &str, input: Option<&InputFile>) -> Result<ExecutionPlan, ExecError> {
        validate_source(source)?;

        let source_file = self.source_file(source);
        let mut files = vec![PlannedFile {
            name: source_file.clone(),
            contents: source.as_bytes().to_vec(),
        }];

        if let Some(input) = input {
            validate_file_name(&input.name)?;
            if input.name == source_file || self.is_build_artifact(&input.name) {
                return Err(ExecError::InvalidRequest(format!(
                    "input file '{}' collides with a {} build file",
                    input.name,
                    self.language()
                )));
            }
            files.push(PlannedFile {
                name: input.name.clone(),
                contents: input.bytes.clone(),
            });
        }

        Ok(ExecutionPlan {
            language: self.language(),
            files,
            steps: self.steps(&source_file),
        })
    }
}

fn validate_source(source: &str) -> Result<(), ExecError> {
    if source.trim().is_empty() {
        return Err(ExecError::InvalidSource("source is empty".to_string()));
    }
    if source.contains('\0') {
        return Err(ExecError::InvalidSource(
            "source contains NUL bytes".to_string(),
        ));
    }
    Ok(())
}

/// Accept only plain file names that stay inside the working directory.
pub fn validate_file_name(name: &str) -> Result<(), ExecError> {
    let reject = |reason: &str| {
        Err(ExecError::InvalidRequest(format!(
            "invalid file name '{}': {}",
            name.escape_debug(),
            reason
        )))
    };

    if name.is_empty() {
        return reject("empty");
    }
    if name.len() > MAX_FILE_NAME_BYTES {
        return reject("too long");
    }
    if name == "." || name == ".." {
        return reject("reserved name");
    }
    if name.contains(['/', '\\', '\0']) {
        return reject("must not contain path separators or NUL");
    }
    Ok(())
}
