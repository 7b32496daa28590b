use crate::language::{CommandStep, Language, LanguageAdapter};

#[derive(Debug, Clone, Default)]
pub struct JavascriptAdapter;

impl LanguageAdapter for JavascriptAdapter {
    fn language(&self) -> Language {
        Language::Javascript
    }

    fn source_file(&self, _source: &str) -> String {
        "main.js".to_string()
    }

    fn steps(&self, source_file: &str) -> Vec<CommandStep> {
        vec![CommandStep::run(["node", source_file])]
    }
}
