use std::path::Path;

use crate::engine::{
    language::{Invocation, LanguageAdapter},
    models::{ExecutionLimits, Language},
    sandbox::MemoryCap,
};

/// `javac` insists the public class matches the file name.
const SOURCE: &str = "Main.java";
const MAIN_CLASS: &str = "Main";

pub(super) struct JavaAdapter;

impl LanguageAdapter for JavaAdapter {
    fn language(&self) -> Language {
        Language::Java
    }

    fn source_file(&self) -> &'static str {
        SOURCE
    }

    fn compiled(&self) -> bool {
        true
    }

    fn prepare_command(&self, workspace: &Path, flags: &[String]) -> Invocation {
        let dir = workspace.display().to_string();
        let mut args = vec![
            "-J-Xmx512m".to_string(),
            "-J-XX:-UsePerfData".to_string(),
            "-encoding".to_string(),
            "UTF-8".to_string(),
        ];
        args.extend(flags.iter().cloned());
        args.extend([
            "-d".to_string(),
            dir,
            workspace.join(SOURCE).display().to_string(),
        ]);
        Invocation::new("javac", args)
    }

    fn run_command(&self, workspace: &Path, limits: &ExecutionLimits) -> Invocation {
        let heap_mb = (limits.memory_mb * 3 / 4).max(32);
        Invocation::new(
            "java",
            [
                "-XX:-UsePerfData".to_string(),
                "-XX:+UseSerialGC".to_string(),
                "-XX:TieredStopAtLevel=1".to_string(),
                "-Xss64m".to_string(),
                format!("-Xmx{heap_mb}m"),
                "-cp".to_string(),
                workspace.display().to_string(),
                MAIN_CLASS.to_string(),
            ],
        )
    }

    fn run_memory_cap(&self) -> MemoryCap {
        MemoryCap::Resident
    }

    fn prepare_memory_cap(&self) -> MemoryCap {
        MemoryCap::Resident
    }

    // The JVM starts a dozen service threads before main runs.
    fn adjust_limits(&self, mut limits: ExecutionLimits) -> ExecutionLimits {
        limits.max_processes = limits.max_processes.max(64);
        limits
    }
}
