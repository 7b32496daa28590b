use crate::language::{CommandStep, Language, LanguageAdapter};

/// Compiled C-family languages: build a `main` binary, then run it.
#[derive(Debug, Clone)]
pub struct NativeAdapter {
    language: Language,
    compiler: &'static str,
    standard: &'static str,
    extension: &'static str,
    link_flags: &'static [&'static str],
}

impl NativeAdapter {
    pub const CPP: NativeAdapter = NativeAdapter {
        language: Language::Cpp,
        compiler: "g++",
        standard: "-std=c++17",
        extension: "cpp",
        link_flags: &[],
    };

    pub const C: NativeAdapter = NativeAdapter {
        language: Language::C,
        compiler: "gcc",
        standard: "-std=c11",
        extension: "c",
        link_flags: &["-lm"],
    };

    const BINARY: &'static str = "main";
}

impl LanguageAdapter for NativeAdapter {
    fn language(&self) -> Language {
        self.language
    }

    fn source_file(&self, _source: &str) -> String {
        format!("main.{}", self.extension)
    }

    fn steps(&self, source_file: &str) -> Vec<CommandStep> {
        let mut compile = vec![
            self.compiler.to_string(),
            self.standard.to_string(),
            "-O2".to_string(),
            "-pipe".to_string(),
            "-o".to_string(),
            Self::BINARY.to_string(),
            source_file.to_string(),
        ];
        compile.extend(self.link_flags.iter().map(|f| f.to_string()));

        vec![
            CommandStep::build(compile),
            CommandStep::run([format!("./{}", Self::BINARY)]),
        ]
    }

    fn is_build_artifact(&self, name: &str) -> bool {
        name == Self::BINARY
    }
}
