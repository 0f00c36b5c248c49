mod bash;
mod flags;
mod java;
mod javascript;
mod native;
mod python;
mod workspace;

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    models::{ExecutionLimits, Language, Submission},
    sandbox::{MemoryCap, RunStatus, SandboxBackend, SandboxConfig, SandboxRequest},
};

pub use flags::{validate_args, validate_flags};
pub use workspace::Workspace;

use bash::BashAdapter;
use java::JavaAdapter;
use javascript::JavaScriptAdapter;
use native::{NativeAdapter, NativeToolchain};
use python::PythonAdapter;

const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024;

/// A program plus arguments, resolved against the sandbox `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }
}

/// Per-language capability pair: how to prepare a workspace (compile or
/// syntax check) and how to invoke the prepared unit.
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> Language;

    fn source_file(&self) -> &'static str;

    fn compiled(&self) -> bool;

    fn prepare_command(&self, workspace: &Path, flags: &[String]) -> Invocation;

    fn run_command(&self, workspace: &Path, limits: &ExecutionLimits) -> Invocation;

    fn run_memory_cap(&self) -> MemoryCap {
        MemoryCap::AddressSpace
    }

    fn prepare_memory_cap(&self) -> MemoryCap {
        MemoryCap::AddressSpace
    }

    /// Threaded runtimes need more tasks than a single-threaded program.
    fn adjust_limits(&self, limits: ExecutionLimits) -> ExecutionLimits {
        limits
    }
}

pub fn adapter_for(language: Language) -> &'static dyn LanguageAdapter {
    match language {
        Language::Python => &PythonAdapter,
        Language::JavaScript => &JavaScriptAdapter,
        Language::C => &NativeAdapter {
            toolchain: NativeToolchain::C,
        },
        Language::Cpp => &NativeAdapter {
            toolchain: NativeToolchain::Cpp,
        },
        Language::Rust => &NativeAdapter {
            toolchain: NativeToolchain::Rust,
        },
        Language::Java => &JavaAdapter,
        Language::Bash => &BashAdapter,
    }
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("compilation failed")]
    Compile { diagnostics: String },
    #[error("preparation cancelled")]
    Cancelled,
    #[error("internal error while preparing source: {0}")]
    Internal(String),
}

/// A prepared, read-only workspace plus the adapter that knows how to run it.
pub struct ExecutableUnit {
    adapter: &'static dyn LanguageAdapter,
    workspace: Arc<Workspace>,
    args: Vec<String>,
}

impl std::fmt::Debug for ExecutableUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableUnit")
            .field("language", &self.adapter.language())
            .field("workspace", &self.workspace.path())
            .finish()
    }
}

impl ExecutableUnit {
    pub fn language(&self) -> Language {
        self.adapter.language()
    }

    /// Builds the sandbox request for one run of this unit. Every request
    /// carries limits; there is no unbounded path into the sandbox.
    pub fn invoke(&self, stdin: &[u8], limits: &ExecutionLimits) -> SandboxRequest {
        let limits = self.adapter.adjust_limits(limits.clone()).normalized();
        let invocation = self.adapter.run_command(self.workspace.path(), &limits);
        let mut request = SandboxRequest::new(invocation.program, limits);
        request.args = invocation.args;
        request.args.extend(self.args.iter().cloned());
        request.env = invocation.env;
        request.stdin = stdin.to_vec();
        request.memory_cap = self.adapter.run_memory_cap();
        request
    }
}

/// Materialises the submission into a scoped workspace and runs the
/// adapter's prepare step inside the sandbox under `compile_limits`.
pub async fn prepare(
    submission: &Submission,
    sandbox: &dyn SandboxBackend,
    sandbox_config: &SandboxConfig,
    compile_limits: &ExecutionLimits,
    cancel: &CancellationToken,
) -> Result<ExecutableUnit, PrepareError> {
    let adapter = adapter_for(submission.language);
    let workspace = Workspace::create(
        &sandbox_config.root,
        sandbox_config.run_as,
        adapter.source_file(),
        &submission.source,
    )
    .await
    .map_err(|err| PrepareError::Internal(format!("{err:#}")))?;

    let step = adapter.prepare_command(workspace.path(), &submission.compiler_flags);
    let limits = adapter.adjust_limits(compile_limits.clone()).normalized();
    let mut request = SandboxRequest::new(step.program, limits);
    request.args = step.args;
    request.env = step.env;
    request.memory_cap = adapter.prepare_memory_cap();
    request.writable_dir = Some(workspace.path().to_path_buf());

    let outcome = sandbox.execute(request, cancel).await;
    tracing::debug!(
        submission_id = %submission.id,
        language = %submission.language,
        status = ?outcome.status,
        wall_time_ms = outcome.wall_time_ms,
        "prepare step finished"
    );

    match outcome.status {
        RunStatus::Completed if outcome.exit_code == Some(0) => {}
        RunStatus::Completed => {
            return Err(PrepareError::Compile {
                diagnostics: diagnostics(&outcome.stderr, &outcome.stdout),
            });
        }
        RunStatus::TimedOut if cancel.is_cancelled() => return Err(PrepareError::Cancelled),
        RunStatus::TimedOut => {
            return Err(PrepareError::Compile {
                diagnostics: "compilation exceeded its time limit".to_string(),
            });
        }
        RunStatus::MemoryExceeded => {
            return Err(PrepareError::Compile {
                diagnostics: "compilation exceeded its memory limit".to_string(),
            });
        }
        RunStatus::OutputExceeded => {
            return Err(PrepareError::Compile {
                diagnostics: "compiler output exceeded its size limit".to_string(),
            });
        }
        RunStatus::CrashedSignal => {
            let signal = outcome.signal.unwrap_or_default();
            return Err(PrepareError::Compile {
                diagnostics: format!(
                    "compiler terminated by signal {signal}\n{}",
                    diagnostics(&outcome.stderr, &outcome.stdout)
                ),
            });
        }
        RunStatus::InternalError => return Err(PrepareError::Internal(outcome.stderr)),
    }

    workspace
        .seal()
        .await
        .map_err(|err| PrepareError::Internal(format!("{err:#}")))?;

    Ok(ExecutableUnit {
        adapter,
        workspace: Arc::new(workspace),
        args: submission.args.clone(),
    })
}

fn diagnostics(stderr: &str, stdout: &str) -> String {
    let mut text = String::new();
    for part in [stderr.trim_end(), stdout.trim_end()] {
        if part.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(part);
    }
    if text.len() > MAX_DIAGNOSTIC_BYTES {
        let mut cut = MAX_DIAGNOSTIC_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... diagnostics truncated");
    }
    text
}
