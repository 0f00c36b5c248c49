use std::path::Path;

use crate::engine::{
    language::{Invocation, LanguageAdapter},
    models::{ExecutionLimits, Language},
    sandbox::MemoryCap,
};

const BINARY: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NativeToolchain {
    C,
    Cpp,
    Rust,
}

/// Ahead-of-time compiled languages: one compiler call produces `main`,
/// which is then executed directly.
pub(super) struct NativeAdapter {
    pub toolchain: NativeToolchain,
}

impl LanguageAdapter for NativeAdapter {
    fn language(&self) -> Language {
        match self.toolchain {
            NativeToolchain::C => Language::C,
            NativeToolchain::Cpp => Language::Cpp,
            NativeToolchain::Rust => Language::Rust,
        }
    }

    fn source_file(&self) -> &'static str {
        match self.toolchain {
            NativeToolchain::C => "main.c",
            NativeToolchain::Cpp => "main.cpp",
            NativeToolchain::Rust => "main.rs",
        }
    }

    fn compiled(&self) -> bool {
        true
    }

    fn prepare_command(&self, workspace: &Path, flags: &[String]) -> Invocation {
        let output = workspace.join(BINARY).display().to_string();
        let source = workspace.join(self.source_file()).display().to_string();
        let (program, mut args): (&str, Vec<String>) = match self.toolchain {
            NativeToolchain::C => ("gcc", vec!["-O2".into(), "-std=gnu17".into(), "-pipe".into()]),
            NativeToolchain::Cpp => ("g++", vec!["-O2".into(), "-std=gnu++17".into(), "-pipe".into()]),
            NativeToolchain::Rust => ("rustc", vec!["--edition=2021".into(), "-O".into()]),
        };
        args.extend(flags.iter().cloned());
        args.extend(["-o".to_string(), output, source]);
        if self.toolchain == NativeToolchain::C {
            args.push("-lm".to_string());
        }
        Invocation::new(program, args)
    }

    fn run_command(&self, workspace: &Path, _limits: &ExecutionLimits) -> Invocation {
        Invocation::new(&workspace.join(BINARY).display().to_string(), Vec::<String>::new())
    }

    // rustc maps large arenas and spawns codegen threads.
    fn prepare_memory_cap(&self) -> MemoryCap {
        match self.toolchain {
            NativeToolchain::Rust => MemoryCap::Resident,
            _ => MemoryCap::AddressSpace,
        }
    }
}
