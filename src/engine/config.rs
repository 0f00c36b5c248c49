use std::{
    collections::HashMap,
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
};

use anyhow::{Context, anyhow};

use crate::engine::{
    harness::{Comparator, HarnessConfig},
    models::{ExecutionLimits, Language},
    sandbox::{Enforcement, SandboxConfig},
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub worker_count: usize,
    pub queue_depth: usize,
    pub sandbox: SandboxConfig,
    pub harness: HarnessConfig,
    pub default_limits: ExecutionLimits,
    pub compile_limits: ExecutionLimits,
    pub language_limits: HashMap<Language, ExecutionLimits>,
    pub max_submission_deadline_ms: u64,
    pub internal_retries: u32,
    pub problems_path: Option<PathBuf>,
    pub log_level: String,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str, default: u64| -> u64 { env_parse(&lookup, key, default) };

        let default_limits = ExecutionLimits {
            timeout_ms: parse("DEFAULT_TIMEOUT_MS", 2000),
            cpu_time_ms: parse("DEFAULT_CPU_TIME_MS", 2000),
            memory_mb: parse("DEFAULT_MEMORY_MB", 256),
            max_output_bytes: env_parse(&lookup, "DEFAULT_MAX_OUTPUT_BYTES", 64 * 1024usize),
            max_processes: parse("DEFAULT_MAX_PROCESSES", 32),
            max_file_size_bytes: parse("DEFAULT_MAX_FILE_SIZE_BYTES", 1024 * 1024),
        }
        .normalized();

        let compile_limits = ExecutionLimits {
            timeout_ms: parse("COMPILE_TIMEOUT_MS", 15_000),
            cpu_time_ms: parse("COMPILE_CPU_TIME_MS", 15_000),
            memory_mb: parse("COMPILE_MEMORY_MB", 1024),
            max_output_bytes: env_parse(&lookup, "COMPILE_MAX_OUTPUT_BYTES", 256 * 1024usize),
            max_processes: parse("COMPILE_MAX_PROCESSES", 128),
            max_file_size_bytes: parse("COMPILE_MAX_FILE_SIZE_BYTES", 64 * 1024 * 1024),
        }
        .normalized();

        let language_limits = Language::ALL
            .iter()
            .map(|language| {
                let key = |field: &str| format!("LIMITS_{}_{field}", language.env_key());
                let limits = ExecutionLimits {
                    timeout_ms: parse(key("TIMEOUT_MS").as_str(), default_limits.timeout_ms),
                    cpu_time_ms: parse(key("CPU_TIME_MS").as_str(), default_limits.cpu_time_ms),
                    memory_mb: parse(key("MEMORY_MB").as_str(), default_limits.memory_mb),
                    max_output_bytes: env_parse(
                        &lookup,
                        key("MAX_OUTPUT_BYTES").as_str(),
                        default_limits.max_output_bytes,
                    ),
                    max_processes: parse(key("MAX_PROCESSES").as_str(), default_limits.max_processes),
                    max_file_size_bytes: parse(
                        key("MAX_FILE_SIZE_BYTES").as_str(),
                        default_limits.max_file_size_bytes,
                    ),
                }
                .normalized();
                (*language, limits)
            })
            .collect();

        let comparator = match lookup("COMPARATOR") {
            Some(raw) => raw
                .parse::<Comparator>()
                .map_err(|err| anyhow!(err))
                .context("invalid COMPARATOR")?,
            None => Comparator::default(),
        };

        let enforcement = |key: &str| -> anyhow::Result<Enforcement> {
            match lookup(key) {
                Some(raw) => raw
                    .parse::<Enforcement>()
                    .map_err(|err| anyhow!(err))
                    .with_context(|| format!("invalid {key}")),
                None => Ok(Enforcement::default()),
            }
        };
        let network = enforcement("SANDBOX_NETWORK")?;
        let containment = enforcement("SANDBOX_CONTAINMENT")?;
        let filesystem = enforcement("SANDBOX_FILESYSTEM")?;

        let bind_addr = lookup("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let run_as = run_as_identity(&lookup);

        Ok(Self {
            bind_addr,
            worker_count: env_parse(&lookup, "WORKER_COUNT", 4usize).max(1),
            queue_depth: env_parse(&lookup, "QUEUE_DEPTH", 64usize),
            sandbox: SandboxConfig {
                root: lookup("SANDBOX_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(env::temp_dir),
                run_as,
                network,
                containment,
                filesystem,
                sample_interval_ms: parse("SAMPLE_INTERVAL_MS", 10).max(1),
                kill_grace_ms: parse("KILL_GRACE_MS", 500),
                timeout_margin_ms: parse("TIMEOUT_MARGIN_MS", 100),
            },
            harness: HarnessConfig {
                comparator,
                fail_fast: env_parse(&lookup, "FAIL_FAST", false),
                parallelism: env_parse(&lookup, "PARALLEL_TEST_CASES", 1usize).max(1),
            },
            default_limits,
            compile_limits,
            language_limits,
            max_submission_deadline_ms: parse("MAX_SUBMISSION_DEADLINE_MS", 120_000),
            internal_retries: env_parse(&lookup, "INTERNAL_RETRIES", 1u32).min(3),
            problems_path: lookup("PROBLEMS_PATH").map(PathBuf::from),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn limits_for(&self, language: Language) -> ExecutionLimits {
        self.language_limits
            .get(&language)
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone())
    }
}

/// Identity untrusted processes run as. Only meaningful when the service
/// itself starts as root; otherwise the kernel refuses the switch.
fn run_as_identity<F>(lookup: &F) -> Option<(u32, u32)>
where
    F: Fn(&str) -> Option<String>,
{
    // SAFETY: geteuid has no preconditions and cannot fail.
    let is_root = unsafe { libc::geteuid() } == 0;
    if !is_root {
        return None;
    }
    match lookup("SANDBOX_UID").as_deref() {
        Some("none") | Some("off") => None,
        _ => {
            let uid = env_parse(lookup, "SANDBOX_UID", 65534u32);
            let gid = env_parse(lookup, "SANDBOX_GID", uid);
            Some((uid, gid))
        }
    }
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::EngineConfig;
    use crate::engine::{harness::Comparator, models::Language, sandbox::Enforcement};

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<EngineConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_are_applied() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.default_limits.timeout_ms, 2000);
        assert_eq!(config.harness.comparator, Comparator::Trimmed);
        assert_eq!(config.sandbox.network, Enforcement::BestEffort);
        assert_eq!(config.sandbox.containment, Enforcement::BestEffort);
        assert_eq!(config.sandbox.filesystem, Enforcement::BestEffort);
        assert_eq!(config.limits_for(Language::Python), config.default_limits);
    }

    #[test]
    fn per_language_overrides_only_touch_that_language() {
        let config = config_from(&[
            ("LIMITS_JAVA_MEMORY_MB", "1024"),
            ("LIMITS_JAVA_TIMEOUT_MS", "4000"),
        ])
        .unwrap();
        let java = config.limits_for(Language::Java);
        assert_eq!(java.memory_mb, 1024);
        assert_eq!(java.timeout_ms, 4000);
        assert_eq!(config.limits_for(Language::C).memory_mb, 256);
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let config = config_from(&[("WORKER_COUNT", "lots"), ("QUEUE_DEPTH", "0")]).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_depth, 0);
    }

    #[test]
    fn rejects_unknown_comparator() {
        assert!(config_from(&[("COMPARATOR", "fuzzy")]).is_err());
        let config = config_from(&[("COMPARATOR", "numeric:0.01")]).unwrap();
        assert!(matches!(config.harness.comparator, Comparator::Numeric { .. }));
    }

    #[test]
    fn isolation_layers_are_configured_separately() {
        let config = config_from(&[
            ("SANDBOX_CONTAINMENT", "required"),
            ("SANDBOX_FILESYSTEM", "off"),
        ])
        .unwrap();
        assert_eq!(config.sandbox.containment, Enforcement::Required);
        assert_eq!(config.sandbox.filesystem, Enforcement::Disabled);
        assert_eq!(config.sandbox.network, Enforcement::BestEffort);
        assert!(config_from(&[("SANDBOX_FILESYSTEM", "sometimes")]).is_err());
    }
}
