use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    config::EngineConfig,
    harness::{self, Verdict, VerdictKind},
    language::{self, PrepareError},
    models::{Submission, SubmissionMode},
    sandbox::{RunOutcome, RunStatus, SandboxBackend},
};

/// Headroom on top of the summed per-run limits for workspace setup and
/// process reaping.
const DEADLINE_SLACK_MS: u64 = 1_000;

/// What came out of evaluating one submission. Failures of the host are
/// not represented here; they surface as [`PipelineError`].
#[derive(Debug, Clone)]
pub enum EvaluationResult {
    Judged { verdicts: Vec<Verdict> },
    Ran { outcome: RunOutcome },
    CompileError { diagnostics: String },
}

impl EvaluationResult {
    pub fn timed_out(&self) -> bool {
        match self {
            Self::Judged { verdicts } => verdicts.iter().any(|v| v.kind == VerdictKind::Timeout),
            Self::Ran { outcome } => outcome.status == RunStatus::TimedOut,
            Self::CompileError { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("submission cancelled")]
    Cancelled,
}

/// prepare, then judge or run, for a single submission.
pub struct Pipeline {
    sandbox: Arc<dyn SandboxBackend>,
    config: Arc<EngineConfig>,
}

impl Pipeline {
    pub fn new(sandbox: Arc<dyn SandboxBackend>, config: Arc<EngineConfig>) -> Self {
        Self { sandbox, config }
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    /// Compile time plus every run's wall limit, capped by configuration.
    pub fn deadline_for(&self, submission: &Submission) -> Duration {
        let margin = self.config.sandbox.timeout_margin_ms;
        let compile = self.config.compile_limits.timeout_ms.saturating_add(margin);
        let per_run = self
            .config
            .limits_for(submission.language)
            .timeout_ms
            .saturating_add(margin);
        let runs = per_run.saturating_mul(submission.test_case_count() as u64);
        let total = compile
            .saturating_add(runs)
            .saturating_add(DEADLINE_SLACK_MS)
            .min(self.config.max_submission_deadline_ms);
        Duration::from_millis(total)
    }

    pub async fn evaluate(
        &self,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> Result<EvaluationResult, PipelineError> {
        let prepared = language::prepare(
            submission,
            self.sandbox.as_ref(),
            &self.config.sandbox,
            &self.config.compile_limits,
            cancel,
        )
        .await;
        let unit = match prepared {
            Ok(unit) => unit,
            Err(PrepareError::Compile { diagnostics }) => {
                return Ok(EvaluationResult::CompileError { diagnostics });
            }
            Err(PrepareError::Cancelled) => return Ok(expired(submission)),
            Err(PrepareError::Internal(message)) => return Err(PipelineError::Internal(message)),
        };

        let limits = self.config.limits_for(submission.language);
        match &submission.mode {
            SubmissionMode::Judge { test_cases } => harness::evaluate(
                self.sandbox.as_ref(),
                &unit,
                test_cases,
                &limits,
                &self.config.harness,
                cancel,
            )
            .await
            .map(|verdicts| EvaluationResult::Judged { verdicts })
            .map_err(|err| PipelineError::Internal(err.to_string())),
            SubmissionMode::Run { stdin } => {
                if cancel.is_cancelled() {
                    return Ok(expired(submission));
                }
                let outcome = self
                    .sandbox
                    .execute(unit.invoke(stdin.as_bytes(), &limits), cancel)
                    .await;
                if outcome.status == RunStatus::InternalError {
                    return Err(PipelineError::Internal(outcome.stderr));
                }
                Ok(EvaluationResult::Ran { outcome })
            }
        }
    }
}

fn expired(submission: &Submission) -> EvaluationResult {
    match &submission.mode {
        SubmissionMode::Judge { test_cases } => EvaluationResult::Judged {
            verdicts: (0..test_cases.len())
                .map(|index| Verdict {
                    index,
                    kind: VerdictKind::Timeout,
                    outcome: None,
                })
                .collect(),
        },
        SubmissionMode::Run { .. } => EvaluationResult::Ran {
            outcome: RunOutcome::expired(),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{EvaluationResult, Pipeline, PipelineError};
    use crate::engine::{
        config::EngineConfig,
        harness::VerdictKind,
        models::{Language, Submission, SubmissionMode, TestCase},
        sandbox::{
            ProcessSandbox, RunStatus, SandboxBackend,
            testing::{ScriptedSandbox, completed, with_status},
        },
    };

    pub(crate) fn test_config() -> EngineConfig {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SANDBOX_ROOT", "/tmp/codeverse-judge-tests"),
            ("SANDBOX_NETWORK", "disabled"),
            ("SANDBOX_UID", "none"),
            ("TIMEOUT_MARGIN_MS", "50"),
            ("MAX_SUBMISSION_DEADLINE_MS", "60000"),
        ]);
        EngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
            .expect("test config")
    }

    pub(crate) fn judge_submission(language: Language, source: &str, cases: &[(&str, &str)]) -> Submission {
        Submission {
            id: Uuid::new_v4(),
            language,
            source: source.to_string(),
            compiler_flags: Vec::new(),
            args: Vec::new(),
            problem_id: None,
            mode: SubmissionMode::Judge {
                test_cases: cases
                    .iter()
                    .map(|(input, expected)| TestCase {
                        input: input.to_string(),
                        expected_output: expected.to_string(),
                    })
                    .collect(),
            },
            accepted_at: Utc::now(),
        }
    }

    fn pipeline(sandbox: Arc<dyn SandboxBackend>) -> Pipeline {
        Pipeline::new(sandbox, Arc::new(test_config()))
    }

    #[tokio::test]
    async fn judged_submission_yields_ordered_verdicts() {
        let sandbox = ScriptedSandbox::new(vec![completed("", 0), completed("9\n", 0), completed("9\n", 0)]);
        let result = pipeline(sandbox)
            .evaluate(
                &judge_submission(Language::Python, "x", &[("2 7", "9"), ("2 7", "10")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let EvaluationResult::Judged { verdicts } = result else {
            panic!("expected verdicts, got {result:?}");
        };
        assert_eq!(verdicts[0].kind, VerdictKind::Passed);
        assert_eq!(verdicts[1].kind, VerdictKind::WrongOutput);
    }

    #[tokio::test]
    async fn compile_failure_short_circuits_test_cases() {
        let mut failing = completed("", 1);
        failing.stderr = "error[E0425]: cannot find value `x`".to_string();
        let sandbox = ScriptedSandbox::new(vec![failing]);
        let result = pipeline(sandbox.clone())
            .evaluate(
                &judge_submission(Language::Rust, "fn main() { x }", &[("", "")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(result, EvaluationResult::CompileError { ref diagnostics } if diagnostics.contains("E0425")));
        assert_eq!(sandbox.request_count(), 1);
    }

    #[tokio::test]
    async fn run_mode_executes_once_with_custom_stdin() {
        let sandbox = ScriptedSandbox::new(vec![completed("", 0)]);
        let mut submission = judge_submission(Language::Bash, "cat", &[]);
        submission.mode = SubmissionMode::Run {
            stdin: "hello".to_string(),
        };
        let result = pipeline(sandbox.clone())
            .evaluate(&submission, &CancellationToken::new())
            .await
            .unwrap();
        let EvaluationResult::Ran { outcome } = result else {
            panic!("expected a single run");
        };
        assert_eq!(outcome.stdout, "hello");
        assert_eq!(sandbox.request_count(), 2);
    }

    #[tokio::test]
    async fn sandbox_failure_is_an_internal_error() {
        let sandbox = ScriptedSandbox::new(vec![completed("", 0), with_status(RunStatus::InternalError)]);
        let result = pipeline(sandbox)
            .evaluate(
                &judge_submission(Language::C, "int main(){}", &[("", "")]),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(PipelineError::Internal(_))));
    }

    #[test]
    fn deadline_sums_compile_and_runs_within_cap() {
        let pipeline = pipeline(ScriptedSandbox::new(Vec::new()));
        let submission = judge_submission(Language::Python, "x", &[("", ""), ("", "")]);
        // compile 15000+50, two runs of 2000+50, slack 1000
        assert_eq!(pipeline.deadline_for(&submission), Duration::from_millis(20_150));

        let many: Vec<(&str, &str)> = vec![("", ""); 100];
        let submission = judge_submission(Language::Python, "x", &many);
        assert_eq!(pipeline.deadline_for(&submission), Duration::from_millis(60_000));
    }

    async fn verdict_kinds(pipeline: &Pipeline, submission: &Submission) -> Vec<VerdictKind> {
        match pipeline.evaluate(submission, &CancellationToken::new()).await {
            Ok(EvaluationResult::Judged { verdicts }) => verdicts.iter().map(|v| v.kind).collect(),
            other => panic!("expected verdicts, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_submission_judged_twice_gets_same_verdicts() {
        if !std::path::Path::new("/bin/bash").exists() {
            return;
        }
        let config = test_config();
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox.clone()).unwrap());
        let pipeline = Pipeline::new(sandbox, Arc::new(config));

        let mut submissions = vec![(
            judge_submission(Language::Bash, "cat", &[("hello", "hello"), ("a", "b"), ("", "")]),
            vec![VerdictKind::Passed, VerdictKind::WrongOutput, VerdictKind::Passed],
        )];
        if std::path::Path::new("/usr/bin/python3").exists() {
            submissions.push((
                judge_submission(
                    Language::Python,
                    "a, b = map(int, input().split())\nprint(a + b)\n",
                    &[("2 7", "9"), ("2 7", "10"), ("-1 1", "0")],
                ),
                vec![VerdictKind::Passed, VerdictKind::WrongOutput, VerdictKind::Passed],
            ));
        }

        for (submission, expected) in &submissions {
            let first = verdict_kinds(&pipeline, submission).await;
            let second = verdict_kinds(&pipeline, submission).await;
            assert_eq!(&first, expected, "{}", submission.language);
            assert_eq!(first, second, "{}", submission.language);
        }
    }
}
