use crate::language::{CommandStep, Language, LanguageAdapter};

#[derive(Debug, Clone, Default)]
pub struct ShellAdapter;

impl LanguageAdapter for ShellAdapter {
    fn language(&self) -> Language {
        Language::Shell
    }

    fn source_file(&self, _source: &str) -> String {
        "main.sh".to_string()
    }

    fn steps(&self, source_file: &str) -> Vec<CommandStep> {
        vec![CommandStep::run(["sh", source_file])]
    }
}
