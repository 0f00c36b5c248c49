mod isolation;
mod proctree;
mod process;

use std::{path::PathBuf, str::FromStr};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::engine::models::ExecutionLimits;

pub use process::ProcessSandbox;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Base directory under which scoped run directories are created.
    pub root: PathBuf,
    /// uid/gid untrusted processes are switched to before exec.
    pub run_as: Option<(u32, u32)>,
    /// Private network namespace.
    pub network: Enforcement,
    /// PID namespace whose init takes every descendant down with it.
    pub containment: Enforcement,
    /// Landlock ruleset limiting writes to the run's own directory.
    pub filesystem: Enforcement,
    pub sample_interval_ms: u64,
    pub kill_grace_ms: u64,
    pub timeout_margin_ms: u64,
}

/// How hard an isolation layer is insisted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Enforcement {
    /// Spawning fails if the layer cannot be set up.
    Required,
    #[default]
    BestEffort,
    Disabled,
}

impl FromStr for Enforcement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" | "strict" => Ok(Self::Required),
            "best_effort" | "best-effort" => Ok(Self::BestEffort),
            "disabled" | "off" => Ok(Self::Disabled),
            other => Err(format!("unsupported enforcement level: {other}")),
        }
    }
}

/// How the memory ceiling is enforced for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCap {
    /// `RLIMIT_AS` plus resident-set sampling.
    AddressSpace,
    /// Resident-set sampling only, for runtimes that reserve large virtual
    /// regions up front (JVM, V8).
    Resident,
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    pub limits: ExecutionLimits,
    pub memory_cap: MemoryCap,
    /// Directory the process may write to. A fresh scoped directory is
    /// created when absent.
    pub writable_dir: Option<PathBuf>,
}

impl SandboxRequest {
    pub fn new(program: impl Into<String>, limits: ExecutionLimits) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: Vec::new(),
            limits,
            memory_cap: MemoryCap::AddressSpace,
            writable_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    TimedOut,
    MemoryExceeded,
    OutputExceeded,
    CrashedSignal,
    InternalError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_kb: u64,
}

impl RunOutcome {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::InternalError,
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: message.into(),
            wall_time_ms: 0,
            cpu_time_ms: 0,
            peak_memory_kb: 0,
        }
    }

    /// Placeholder for a run that never started because its deadline passed.
    pub fn expired() -> Self {
        Self {
            status: RunStatus::TimedOut,
            ..Self::internal("submission deadline exceeded")
        }
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs one untrusted program to completion under `request.limits`.
    /// Cancelling `cancel` hard-kills the process group and yields
    /// [`RunStatus::TimedOut`].
    async fn execute(&self, request: SandboxRequest, cancel: &CancellationToken) -> RunOutcome;
}
