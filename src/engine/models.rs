use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "python", alias = "py", alias = "python3")]
    Python,
    #[serde(rename = "javascript", alias = "js", alias = "node")]
    JavaScript,
    #[serde(rename = "c")]
    C,
    #[serde(rename = "cpp", alias = "c++", alias = "cxx")]
    Cpp,
    #[serde(rename = "java")]
    Java,
    #[serde(rename = "rust", alias = "rs")]
    Rust,
    #[serde(rename = "bash", alias = "sh")]
    Bash,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Python,
        Language::JavaScript,
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::Rust,
        Language::Bash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Rust => "rust",
            Language::Bash => "bash",
        }
    }

    /// Upper-case token used in `LIMITS_<LANG>_<FIELD>` configuration keys.
    pub fn env_key(&self) -> &'static str {
        match self {
            Language::Python => "PYTHON",
            Language::JavaScript => "JAVASCRIPT",
            Language::C => "C",
            Language::Cpp => "CPP",
            Language::Java => "JAVA",
            Language::Rust => "RUST",
            Language::Bash => "BASH",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Self::Python),
            "javascript" | "js" | "node" => Ok(Self::JavaScript),
            "c" => Ok(Self::C),
            "cpp" | "c++" | "cxx" => Ok(Self::Cpp),
            "java" => Ok(Self::Java),
            "rust" | "rs" => Ok(Self::Rust),
            "bash" | "sh" => Ok(Self::Bash),
            other => Err(format!("unsupported language: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLimits {
    pub timeout_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_mb: u64,
    pub max_output_bytes: usize,
    pub max_processes: u64,
    pub max_file_size_bytes: u64,
}

impl ExecutionLimits {
    pub fn normalized(mut self) -> Self {
        self.timeout_ms = self.timeout_ms.clamp(50, 120_000);
        self.cpu_time_ms = self.cpu_time_ms.clamp(50, self.timeout_ms);
        self.memory_mb = self.memory_mb.clamp(16, 8192);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 16 * 1024 * 1024);
        self.max_processes = self.max_processes.clamp(1, 1024);
        self.max_file_size_bytes = self.max_file_size_bytes.clamp(1024, 512 * 1024 * 1024);
        self
    }

    pub fn wall_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// Whole seconds for `RLIMIT_CPU`; never zero so the limit is always armed.
    pub fn cpu_seconds(&self) -> u64 {
        self.cpu_time_ms.div_ceil(1000).max(1)
    }
}

/// Problem identifier; accepts both numeric and string ids on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProblemId(pub String);

impl<'de> Deserialize<'de> for ProblemId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Num(n) => ProblemId(n.to_string()),
            Raw::Str(s) => ProblemId(s.trim().to_string()),
        })
    }
}

impl fmt::Display for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub problem_id: Option<ProblemId>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub compiler_flags: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SubmissionMode {
    /// Evaluate against test cases and produce verdicts.
    Judge { test_cases: Vec<TestCase> },
    /// Execute once against custom stdin.
    Run { stdin: String },
}

/// One accepted unit of untrusted code. Never mutated after acceptance.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Uuid,
    pub language: Language,
    pub source: String,
    pub compiler_flags: Vec<String>,
    pub args: Vec<String>,
    pub problem_id: Option<ProblemId>,
    pub mode: SubmissionMode,
    pub accepted_at: DateTime<Utc>,
}

impl SubmissionMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Judge { .. } => "judge",
            Self::Run { .. } => "run",
        }
    }
}

impl Submission {
    pub fn test_case_count(&self) -> usize {
        match &self.mode {
            SubmissionMode::Judge { test_cases } => test_cases.len(),
            SubmissionMode::Run { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageInfo {
    pub language: Language,
    pub compiled: bool,
    pub limits: ExecutionLimits,
}
