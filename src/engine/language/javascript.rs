use std::path::Path;

use crate::engine::{
    language::{Invocation, LanguageAdapter},
    models::{ExecutionLimits, Language},
    sandbox::MemoryCap,
};

const SOURCE: &str = "main.js";

pub(super) struct JavaScriptAdapter;

impl LanguageAdapter for JavaScriptAdapter {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn source_file(&self) -> &'static str {
        SOURCE
    }

    fn compiled(&self) -> bool {
        false
    }

    fn prepare_command(&self, workspace: &Path, _flags: &[String]) -> Invocation {
        let source = workspace.join(SOURCE).display().to_string();
        Invocation::new("node", ["--check", source.as_str()])
    }

    fn run_command(&self, workspace: &Path, limits: &ExecutionLimits) -> Invocation {
        let source = workspace.join(SOURCE).display().to_string();
        let heap_mb = (limits.memory_mb * 3 / 4).max(16);
        Invocation::new(
            "node",
            [
                format!("--max-old-space-size={heap_mb}"),
                "--stack-size=4096".to_string(),
                source,
            ],
        )
    }

    // V8 reserves far more address space than it touches.
    fn run_memory_cap(&self) -> MemoryCap {
        MemoryCap::Resident
    }

    fn prepare_memory_cap(&self) -> MemoryCap {
        MemoryCap::Resident
    }

    fn adjust_limits(&self, mut limits: ExecutionLimits) -> ExecutionLimits {
        limits.max_processes = limits.max_processes.max(32);
        limits
    }
}
