use std::path::Path;

use crate::engine::{
    language::{Invocation, LanguageAdapter},
    models::{ExecutionLimits, Language},
};

const SOURCE: &str = "main.sh";

pub(super) struct BashAdapter;

impl LanguageAdapter for BashAdapter {
    fn language(&self) -> Language {
        Language::Bash
    }

    fn source_file(&self) -> &'static str {
        SOURCE
    }

    fn compiled(&self) -> bool {
        false
    }

    fn prepare_command(&self, workspace: &Path, _flags: &[String]) -> Invocation {
        let source = workspace.join(SOURCE).display().to_string();
        Invocation::new("bash", ["-n", source.as_str()])
    }

    fn run_command(&self, workspace: &Path, _limits: &ExecutionLimits) -> Invocation {
        let source = workspace.join(SOURCE).display().to_string();
        Invocation::new("bash", ["--noprofile", "--norc", source.as_str()])
    }
}
