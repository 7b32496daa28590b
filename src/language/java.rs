use crate::language::{CommandStep, Language, LanguageAdapter};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default)]
pub struct JavaAdapter;

/// javac insists the file is named after its public class.
pub fn detect_class_name(source: &str) -> String {
    static PUBLIC_CLASS: OnceLock<Regex> = OnceLock::new();
    let re = PUBLIC_CLASS.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(?:@[\w.]+(?:\([^)]*\))?\s*)*public\s+(?:(?:final|abstract|strictfp)\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        )
        .expect("static regex")
    });

    re.captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "Main".to_string())
}

impl LanguageAdapter for JavaAdapter {
    fn language(&self) -> Language {
        Language::Java
    }

    fn source_file(&self, source: &str) -> String {
        format!("{}.java", detect_class_name(source))
    }

    fn steps(&self, source_file: &str) -> Vec<CommandStep> {
        let class_name = source_file.trim_end_matches(".java");
        vec![
            CommandStep::build(["javac", "-encoding", "UTF-8", source_file]),
            CommandStep::run([
                "java",
                "-Xss1m",
                "-XX:+UseSerialGC",
                "-cp",
                ".",
                class_name,
            ]),
        ]
    }

    fn is_build_artifact(&self, name: &str) -> bool {
        name.ends_with(".class")
    }
}
