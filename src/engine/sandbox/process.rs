use std::{
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::Notify,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{
    models::ExecutionLimits,
    sandbox::{
        Enforcement, RunOutcome, RunStatus, SandboxBackend, SandboxConfig, SandboxRequest,
        isolation::IsolationPlan,
        proctree::{self, ResourceSample, TreeSampler},
    },
};

const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const OOM_MARKERS: [&str; 5] = [
    "MemoryError",
    "std::bad_alloc",
    "java.lang.OutOfMemoryError",
    "JavaScript heap out of memory",
    "memory allocation of",
];

const TRIAL_LIMITS: ExecutionLimits = ExecutionLimits {
    timeout_ms: 5_000,
    cpu_time_ms: 2_000,
    memory_mb: 64,
    max_output_bytes: 4096,
    max_processes: 16,
    max_file_size_bytes: 4096,
};

pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.root).with_context(|| {
            format!("failed to create sandbox root {}", config.root.display())
        })?;
        Ok(Self { config })
    }

    /// Runs a trial program and reports which isolation layers the kernel
    /// actually granted. Fails when a `Required` layer is missing and warns
    /// about best-effort layers that are not in effect.
    pub async fn self_check(&self) -> anyhow::Result<IsolationReport> {
        let marker = self
            .config
            .root
            .join(format!(".write-check-{}", Uuid::new_v4().simple()));
        let mut request = SandboxRequest::new("/bin/sh", TRIAL_LIMITS);
        request.args = vec![
            "-c".to_string(),
            format!("echo $$; : > '{}' 2>/dev/null; exit 0", marker.display()),
        ];
        let outcome = self.execute(request, &CancellationToken::new()).await;
        if outcome.status != RunStatus::Completed {
            bail!(
                "trial run ended as {:?}: {}",
                outcome.status,
                outcome.stderr.trim()
            );
        }
        let filesystem_confined = !marker.exists();
        if !filesystem_confined {
            let _ = std::fs::remove_file(&marker);
        }
        let report = IsolationReport {
            // The payload is pid 2 of its namespace, right under the init.
            contained: outcome.stdout.trim().parse::<u32>().is_ok_and(|pid| pid <= 2),
            filesystem_confined,
            dedicated_identity: self.config.run_as.is_some(),
        };
        report.enforce(&self.config)?;
        Ok(report)
    }
}

/// Isolation observed on this host by [`ProcessSandbox::self_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationReport {
    pub contained: bool,
    pub filesystem_confined: bool,
    pub dedicated_identity: bool,
}

impl IsolationReport {
    fn enforce(&self, config: &SandboxConfig) -> anyhow::Result<()> {
        check_layer(
            "containment",
            config.containment,
            self.contained,
            "descendants are only swept while a run is being killed",
        )?;
        check_layer(
            "filesystem",
            config.filesystem,
            self.filesystem_confined,
            "runs can write wherever the service user can",
        )?;
        if !self.dedicated_identity {
            tracing::warn!("no dedicated sandbox identity; untrusted code runs as the service user");
        }
        Ok(())
    }
}

fn check_layer(
    layer: &'static str,
    level: Enforcement,
    active: bool,
    consequence: &'static str,
) -> anyhow::Result<()> {
    match (level, active) {
        (Enforcement::Disabled, _) | (_, true) => Ok(()),
        (Enforcement::Required, false) => bail!("{layer} isolation is required but unavailable"),
        (Enforcement::BestEffort, false) => {
            tracing::warn!(layer, consequence, "isolation layer unavailable");
            Ok(())
        }
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, request: SandboxRequest, cancel: &CancellationToken) -> RunOutcome {
        let program = request.program.clone();
        match self.run(request, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(program = %program, error = %format!("{err:#}"), "sandbox setup failed");
                RunOutcome::internal(format!("{err:#}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    WallClock,
    Cancelled,
    OutputLimit,
    MemoryLimit,
    CpuLimit,
}

enum Termination {
    Exited(ExitStatus),
    Killed(KillReason),
}

impl ProcessSandbox {
    async fn run(
        &self,
        request: SandboxRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let limits = request.limits.clone();
        let scratch = match &request.writable_dir {
            Some(_) => None,
            None => Some(self.scratch_dir()?),
        };
        let work_dir = match (&request.writable_dir, &scratch) {
            (Some(dir), _) => dir.as_path(),
            (None, Some(tmp)) => tmp.path(),
            (None, None) => anyhow::bail!("no working directory for sandboxed run"),
        };

        let plan = IsolationPlan::for_request(&request, &self.config, work_dir)
            .context("failed to plan run isolation")?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .env_clear()
            .envs(base_env(work_dir))
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some((uid, gid)) = self.config.run_as {
            cmd.uid(uid).gid(gid);
        }
        // SAFETY: the hook only performs async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || plan.apply());
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", request.program))?;
        let pid = child.id().context("sandboxed process exited before tracking")?;
        let group = ProcessGroupGuard { root: pid };

        if let Some(mut stdin) = child.stdin.take() {
            let stdin_bytes = request.stdin;
            tokio::spawn(async move {
                let _ = stdin.write_all(&stdin_bytes).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take().context("missing stdout pipe")?;
        let stderr = child.stderr.take().context("missing stderr pipe")?;
        let overflow = Arc::new(Notify::new());
        let output_limit = limits.max_output_bytes;
        let stdout_task = {
            let overflow = overflow.clone();
            tokio::spawn(async move { read_limited(stdout, output_limit, Some(overflow)).await })
        };
        let stderr_task = tokio::spawn(async move { read_limited(stderr, output_limit, None).await });

        let wall_limit =
            limits.wall_timeout() + Duration::from_millis(self.config.timeout_margin_ms);
        let deadline = tokio::time::sleep(wall_limit);
        tokio::pin!(deadline);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.sample_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let memory_limit = limits.memory_bytes();
        let mut usage = ResourceSample::default();
        let mut tree = TreeSampler::new(pid);

        let termination = loop {
            tokio::select! {
                waited = child.wait() => {
                    break Termination::Exited(waited.context("failed to wait for sandboxed process")?);
                }
                _ = &mut deadline => break Termination::Killed(KillReason::WallClock),
                _ = cancel.cancelled() => break Termination::Killed(KillReason::Cancelled),
                _ = overflow.notified() => break Termination::Killed(KillReason::OutputLimit),
                _ = ticker.tick() => {
                    if let Some(sample) = tree.sample().await {
                        usage = merge_usage(usage, sample);
                        if sample.rss_kb.saturating_mul(1024) > memory_limit {
                            break Termination::Killed(KillReason::MemoryLimit);
                        }
                        // RLIMIT_CPU only has whole-second granularity.
                        if usage.cpu_time_ms > limits.cpu_time_ms {
                            break Termination::Killed(KillReason::CpuLimit);
                        }
                    }
                }
            }
        };

        let grace = Duration::from_millis(self.config.kill_grace_ms);
        let (kill_reason, exit_status) = match termination {
            Termination::Exited(status) => (None, Some(status)),
            Termination::Killed(reason) => {
                group.terminate().await;
                let _ = child.start_kill();
                let reaped = tokio::time::timeout(grace, child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                (Some(reason), reaped)
            }
        };
        let wall_time_ms = started.elapsed().as_millis() as u64;
        // Stray descendants holding the pipes open die with the group.
        drop(group);

        let stdout = join_capture(stdout_task, grace).await;
        let stderr = join_capture(stderr_task, grace).await;
        let stderr_text = String::from_utf8_lossy(&stderr.bytes).to_string();

        let status = classify(
            kill_reason,
            exit_status,
            &usage,
            &limits,
            stdout.overflowed,
            &stderr_text,
        );
        if status != RunStatus::Completed {
            tracing::debug!(pid, status = ?status, wall_time_ms, "sandboxed run ended abnormally");
        }

        drop(scratch);
        Ok(RunOutcome {
            status,
            exit_code: exit_status.and_then(|s| s.code()),
            signal: exit_status.and_then(|s| s.signal()),
            stdout: String::from_utf8_lossy(&stdout.bytes).to_string(),
            stderr: stderr_text,
            wall_time_ms,
            cpu_time_ms: usage.cpu_time_ms,
            peak_memory_kb: usage.peak_rss_kb,
        })
    }

    fn scratch_dir(&self) -> anyhow::Result<TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("judge-run-")
            .tempdir_in(&self.config.root)
            .context("failed to create scoped run directory")?;
        if let Some((uid, gid)) = self.config.run_as {
            std::os::unix::fs::chown(dir.path(), Some(uid), Some(gid))
                .context("failed to hand run directory to sandbox identity")?;
        }
        Ok(dir)
    }
}

/// Hard-kills the run's process group when dropped. The group leader is
/// the spawned child.
struct ProcessGroupGuard {
    root: u32,
}

impl ProcessGroupGuard {
    fn kill_group(&self) {
        // SAFETY: signalling a process group has no memory-safety requirements.
        unsafe {
            libc::killpg(self.root as libc::pid_t, libc::SIGKILL);
        }
    }

    /// Also reaches descendants that left the group with `setsid`. Only
    /// valid while the root has not been reaped.
    async fn terminate(&self) {
        let root = self.root;
        let stopped = tokio::task::spawn_blocking(move || proctree::stop_tree(root))
            .await
            .unwrap_or_default();
        for pid in &stopped {
            // SAFETY: every pid was stopped above and cannot have been reused.
            unsafe {
                libc::kill(*pid as libc::pid_t, libc::SIGKILL);
            }
        }
        self.kill_group();
        if stopped.len() > 1 {
            tracing::debug!(root, processes = stopped.len(), "killed sandboxed process tree");
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill_group();
    }
}

fn base_env(work_dir: &Path) -> Vec<(String, String)> {
    let dir = work_dir.to_string_lossy().to_string();
    vec![
        ("PATH".to_string(), SAFE_PATH.to_string()),
        ("HOME".to_string(), dir.clone()),
        ("TMPDIR".to_string(), dir),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("LC_ALL".to_string(), "C.UTF-8".to_string()),
    ]
}

fn merge_usage(current: ResourceSample, sample: ResourceSample) -> ResourceSample {
    ResourceSample {
        rss_kb: sample.rss_kb,
        peak_rss_kb: current.peak_rss_kb.max(sample.peak_rss_kb),
        cpu_time_ms: current.cpu_time_ms.max(sample.cpu_time_ms),
    }
}

fn classify(
    kill_reason: Option<KillReason>,
    exit_status: Option<ExitStatus>,
    usage: &ResourceSample,
    limits: &ExecutionLimits,
    stdout_overflowed: bool,
    stderr: &str,
) -> RunStatus {
    match kill_reason {
        Some(KillReason::WallClock) | Some(KillReason::Cancelled) => return RunStatus::TimedOut,
        Some(KillReason::OutputLimit) => return RunStatus::OutputExceeded,
        Some(KillReason::MemoryLimit) => return RunStatus::MemoryExceeded,
        Some(KillReason::CpuLimit) => return RunStatus::TimedOut,
        None => {}
    }

    let Some(status) = exit_status else {
        return RunStatus::InternalError;
    };
    if stdout_overflowed {
        return RunStatus::OutputExceeded;
    }

    let near_memory_limit = usage.peak_rss_kb.saturating_mul(1024) * 10 >= limits.memory_bytes() * 9;
    let reported_oom = OOM_MARKERS.iter().any(|marker| stderr.contains(marker));

    if let Some(signal) = status.signal() {
        return match signal {
            libc::SIGXCPU => RunStatus::TimedOut,
            libc::SIGKILL if usage.cpu_time_ms >= limits.cpu_time_ms => RunStatus::TimedOut,
            libc::SIGXFSZ => RunStatus::OutputExceeded,
            _ if near_memory_limit || reported_oom => RunStatus::MemoryExceeded,
            _ => RunStatus::CrashedSignal,
        };
    }

    if !status.success() && (near_memory_limit || reported_oom) {
        return RunStatus::MemoryExceeded;
    }
    // Exited between two samples but after overrunning its CPU budget.
    if usage.cpu_time_ms > limits.cpu_time_ms {
        return RunStatus::TimedOut;
    }
    RunStatus::Completed
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

async fn join_capture(task: JoinHandle<Captured>, grace: Duration) -> Captured {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => Captured::default(),
        Err(_) => {
            abort.abort();
            Captured::default()
        }
    }
}

/// Keeps the first `limit` bytes and drains the rest so the writer never
/// blocks on a full pipe. `overflow` fires once when the limit is crossed.
async fn read_limited<R>(mut reader: R, limit: usize, overflow: Option<Arc<Notify>>) -> Captured
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    let mut overflowed = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let remaining = limit.saturating_sub(out.len());
                out.extend_from_slice(&chunk[..remaining.min(n)]);
                if n > remaining && !overflowed {
                    overflowed = true;
                    if let Some(notify) = &overflow {
                        notify.notify_one();
                    }
                }
            }
            Err(_) => break,
        }
    }
    Captured {
        bytes: out,
        overflowed,
    }
}
