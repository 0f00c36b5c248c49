use std::path::Path;

use crate::engine::{
    language::{Invocation, LanguageAdapter},
    models::{ExecutionLimits, Language},
};

const SOURCE: &str = "main.py";
const SYNTAX_CHECK: &str = "import sys; compile(open(sys.argv[1], 'rb').read(), sys.argv[1], 'exec')";

pub(super) struct PythonAdapter;

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file(&self) -> &'static str {
        SOURCE
    }

    fn compiled(&self) -> bool {
        false
    }

    // Byte-compiling in memory reports syntax errors without writing .pyc files.
    fn prepare_command(&self, workspace: &Path, _flags: &[String]) -> Invocation {
        let source = workspace.join(SOURCE).display().to_string();
        Invocation::new("python3", ["-I", "-B", "-c", SYNTAX_CHECK, source.as_str()])
    }

    fn run_command(&self, workspace: &Path, _limits: &ExecutionLimits) -> Invocation {
        let source = workspace.join(SOURCE).display().to_string();
        let mut invocation = Invocation::new("python3", ["-I", "-B", source.as_str()]);
        invocation
            .env
            .push(("PYTHONIOENCODING".to_string(), "utf-8".to_string()));
        invocation
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::PythonAdapter;
    use crate::engine::language::{LanguageAdapter, tests::limits};

    #[test]
    fn runs_isolated_without_bytecode() {
        let run = PythonAdapter.run_command(Path::new("/ws"), &limits());
        assert_eq!(run.program, "python3");
        assert_eq!(run.args, ["-I", "-B", "/ws/main.py"]);
    }

    #[test]
    fn syntax_check_targets_the_source() {
        let check = PythonAdapter.prepare_command(Path::new("/ws"), &[]);
        assert_eq!(check.args.last().map(String::as_str), Some("/ws/main.py"));
    }
}
