use crate::language::{CommandStep, Language, LanguageAdapter};

#[derive(Debug, Clone, Default)]
pub struct PythonAdapter;

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file(&self, _source: &str) -> String {
        "main.py".to_string()
    }

    fn steps(&self, source_file: &str) -> Vec<CommandStep> {
        // No compile stage; -u keeps output flowing if the run is killed mid-way.
        vec![CommandStep::run(["python3", "-u", source_file])]
    }

    fn is_build_artifact(&self, name: &str) -> bool {
        name == "__pycache__"
    }
}
