use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{
    harness::{Verdict, VerdictKind, worst},
    models::{Language, ProblemId, Submission, SubmissionMode, TestCase},
    pipeline::EvaluationResult,
    sandbox::RunStatus,
    scheduler::Evaluation,
};

pub const RESULT_VERSION: &str = "v1";

const INTERNAL_ERROR_MESSAGE: &str = "the submission could not be executed because of an internal error";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("malformed verdict list: {0}")]
    MalformedVerdicts(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub passed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseReport {
    pub index: usize,
    pub verdict: VerdictKind,
    pub input: String,
    pub expected_output: String,
    pub actual_output: Option<String>,
    pub stderr: Option<String>,
    pub status: Option<RunStatus>,
    pub exit_code: Option<i32>,
    pub wall_time_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
}

/// Wire shape returned for every submission, versioned by `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub version: &'static str,
    pub submission_id: Uuid,
    pub language: Language,
    pub problem_id: Option<ProblemId>,
    /// Worst verdict across test cases; absent for single runs and
    /// internal failures.
    pub verdict: Option<VerdictKind>,
    /// Sandbox status of a single run.
    pub status: Option<RunStatus>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub stderr: Option<String>,
    pub verdicts: Vec<TestCaseReport>,
    pub aggregate: Aggregate,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    fn empty(submission: &Submission, elapsed_ms: u64) -> Self {
        Self {
            version: RESULT_VERSION,
            submission_id: submission.id,
            language: submission.language,
            problem_id: submission.problem_id.clone(),
            verdict: None,
            status: None,
            output: None,
            error: None,
            stderr: None,
            verdicts: Vec::new(),
            aggregate: Aggregate {
                passed: 0,
                total: judged_total(submission),
            },
            elapsed_ms,
        }
    }

    pub fn is_compile_error(&self) -> bool {
        self.verdict == Some(VerdictKind::CompileError)
    }
}

/// Pure mapping from an evaluated submission to its wire result.
pub fn format(submission: &Submission, evaluation: &Evaluation) -> Result<ExecutionResult, ReportError> {
    let mut result = ExecutionResult::empty(submission, evaluation.elapsed_ms);
    match (&evaluation.result, &submission.mode) {
        (EvaluationResult::CompileError { diagnostics }, _) => {
            result.verdict = Some(VerdictKind::CompileError);
            result.error = Some(diagnostics.clone());
        }
        (EvaluationResult::Ran { outcome }, SubmissionMode::Run { .. }) => {
            result.status = Some(outcome.status);
            result.output = Some(outcome.stdout.clone());
            result.stderr = Some(outcome.stderr.clone()).filter(|s| !s.is_empty());
        }
        (EvaluationResult::Judged { verdicts }, SubmissionMode::Judge { test_cases }) => {
            check_verdicts(verdicts, test_cases.len())?;
            result.verdicts = verdicts
                .iter()
                .map(|verdict| case_report(verdict, &test_cases[verdict.index]))
                .collect();
            result.aggregate.passed = verdicts.iter().filter(|v| v.passed()).count();
            let decisive = worst(verdicts);
            // Nothing was judged, so nothing passed either.
            result.verdict = (!test_cases.is_empty())
                .then(|| decisive.map_or(VerdictKind::Passed, |v| v.kind));
            if let Some(outcome) = decisive.and_then(|v| v.outcome.as_ref()) {
                result.output = Some(outcome.stdout.clone());
                result.stderr = Some(outcome.stderr.clone()).filter(|s| !s.is_empty());
            }
        }
        (EvaluationResult::Ran { .. }, SubmissionMode::Judge { .. }) => {
            return Err(ReportError::MalformedVerdicts(
                "single run reported for a judged submission".to_string(),
            ));
        }
        (EvaluationResult::Judged { .. }, SubmissionMode::Run { .. }) => {
            return Err(ReportError::MalformedVerdicts(
                "verdicts reported for a single run".to_string(),
            ));
        }
    }
    Ok(result)
}

/// Result for a submission that could not be evaluated at all. Host detail
/// stays in the logs.
pub fn internal_failure(submission: &Submission, elapsed_ms: u64) -> ExecutionResult {
    ExecutionResult {
        error: Some(INTERNAL_ERROR_MESSAGE.to_string()),
        ..ExecutionResult::empty(submission, elapsed_ms)
    }
}

fn judged_total(submission: &Submission) -> usize {
    match &submission.mode {
        SubmissionMode::Judge { test_cases } => test_cases.len(),
        SubmissionMode::Run { .. } => 0,
    }
}

fn check_verdicts(verdicts: &[Verdict], total: usize) -> Result<(), ReportError> {
    let mut previous: Option<usize> = None;
    for verdict in verdicts {
        if verdict.index >= total {
            return Err(ReportError::MalformedVerdicts(format!(
                "verdict for test case {} of {total}",
                verdict.index
            )));
        }
        if previous.is_some_and(|p| p >= verdict.index) {
            return Err(ReportError::MalformedVerdicts(format!(
                "test case {} reported out of order",
                verdict.index
            )));
        }
        if verdict.kind == VerdictKind::CompileError {
            return Err(ReportError::MalformedVerdicts(format!(
                "compile error recorded against test case {}",
                verdict.index
            )));
        }
        if verdict.outcome.is_none() && verdict.kind != VerdictKind::Timeout {
            return Err(ReportError::MalformedVerdicts(format!(
                "test case {} has no run but is not a timeout",
                verdict.index
            )));
        }
        previous = Some(verdict.index);
    }
    Ok(())
}

fn case_report(verdict: &Verdict, case: &TestCase) -> TestCaseReport {
    let outcome = verdict.outcome.as_ref();
    TestCaseReport {
        index: verdict.index,
        verdict: verdict.kind,
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output: outcome.map(|o| o.stdout.clone()),
        stderr: outcome.map(|o| o.stderr.clone()).filter(|s| !s.is_empty()),
        status: outcome.map(|o| o.status),
        exit_code: outcome.and_then(|o| o.exit_code),
        wall_time_ms: outcome.map(|o| o.wall_time_ms),
        cpu_time_ms: outcome.map(|o| o.cpu_time_ms),
        peak_memory_kb: outcome.map(|o| o.peak_memory_kb),
    }
}

#[cfg(test)]
mod tests {
    use super::{ReportError, format, internal_failure};
    use crate::engine::{
        harness::{Verdict, VerdictKind},
        models::{Language, SubmissionMode},
        pipeline::{EvaluationResult, tests::judge_submission},
        sandbox::{
            RunStatus,
            testing::{completed, with_status},
        },
        scheduler::Evaluation,
    };

    fn evaluation(result: EvaluationResult) -> Evaluation {
        Evaluation {
            result,
            elapsed_ms: 42,
            attempts: 1,
        }
    }

    fn verdict(index: usize, kind: VerdictKind, stdout: &str) -> Verdict {
        Verdict {
            index,
            kind,
            outcome: Some(completed(stdout, 0)),
        }
    }

    #[test]
    fn judged_result_aggregates_and_picks_worst() {
        let submission = judge_submission(Language::Python, "x", &[("2 7", "9"), ("2 7", "10"), ("1 1", "2")]);
        let result = format(
            &submission,
            &evaluation(EvaluationResult::Judged {
                verdicts: vec![
                    verdict(0, VerdictKind::Passed, "9\n"),
                    verdict(1, VerdictKind::WrongOutput, "9\n"),
                    verdict(2, VerdictKind::Passed, "2\n"),
                ],
            }),
        )
        .unwrap();
        assert_eq!(result.version, "v1");
        assert_eq!(result.verdict, Some(VerdictKind::WrongOutput));
        assert_eq!(result.aggregate.passed, 2);
        assert_eq!(result.aggregate.total, 3);
        assert_eq!(result.output.as_deref(), Some("9\n"));
        assert_eq!(result.error, None);
        assert_eq!(result.verdicts[1].expected_output, "10");
        assert_eq!(result.verdicts[1].actual_output.as_deref(), Some("9\n"));
    }

    #[test]
    fn fail_fast_results_count_all_cases_in_total() {
        let submission = judge_submission(Language::Python, "x", &[("", "1"), ("", "2")]);
        let result = format(
            &submission,
            &evaluation(EvaluationResult::Judged {
                verdicts: vec![verdict(0, VerdictKind::WrongOutput, "0")],
            }),
        )
        .unwrap();
        assert_eq!(result.aggregate.passed, 0);
        assert_eq!(result.aggregate.total, 2);
        assert_eq!(result.verdicts.len(), 1);
    }

    #[test]
    fn judging_zero_cases_has_no_verdict() {
        let submission = judge_submission(Language::Python, "x", &[]);
        let result = format(
            &submission,
            &evaluation(EvaluationResult::Judged { verdicts: Vec::new() }),
        )
        .unwrap();
        assert_eq!(result.verdict, None);
        assert_eq!(result.aggregate.passed, 0);
        assert_eq!(result.aggregate.total, 0);
    }

    #[test]
    fn compile_error_carries_diagnostics_verbatim() {
        let submission = judge_submission(Language::C, "int main(", &[("", "")]);
        let result = format(
            &submission,
            &evaluation(EvaluationResult::CompileError {
                diagnostics: "main.c:1:10: error: expected declaration".to_string(),
            }),
        )
        .unwrap();
        assert!(result.is_compile_error());
        assert_eq!(result.error.as_deref(), Some("main.c:1:10: error: expected declaration"));
        assert!(result.verdicts.is_empty());
        assert_eq!(result.aggregate.passed, 0);
    }

    #[test]
    fn run_mode_reports_stdout_and_status() {
        let mut submission = judge_submission(Language::Bash, "cat", &[]);
        submission.mode = SubmissionMode::Run {
            stdin: "hello".to_string(),
        };
        let mut outcome = with_status(RunStatus::TimedOut);
        outcome.stdout = "partial".to_string();
        let result = format(&submission, &evaluation(EvaluationResult::Ran { outcome })).unwrap();
        assert_eq!(result.status, Some(RunStatus::TimedOut));
        assert_eq!(result.output.as_deref(), Some("partial"));
        assert_eq!(result.verdict, None);
        assert_eq!(result.aggregate.total, 0);
    }

    #[test]
    fn malformed_verdict_lists_are_rejected() {
        let submission = judge_submission(Language::Python, "x", &[("", ""), ("", "")]);
        let out_of_range = EvaluationResult::Judged {
            verdicts: vec![verdict(5, VerdictKind::Passed, "")],
        };
        assert!(matches!(
            format(&submission, &evaluation(out_of_range)),
            Err(ReportError::MalformedVerdicts(_))
        ));
        let duplicated = EvaluationResult::Judged {
            verdicts: vec![verdict(1, VerdictKind::Passed, ""), verdict(1, VerdictKind::Passed, "")],
        };
        assert!(format(&submission, &evaluation(duplicated)).is_err());
        let missing_run = EvaluationResult::Judged {
            verdicts: vec![Verdict {
                index: 0,
                kind: VerdictKind::Passed,
                outcome: None,
            }],
        };
        assert!(format(&submission, &evaluation(missing_run)).is_err());
    }

    #[test]
    fn internal_failure_hides_host_detail() {
        let submission = judge_submission(Language::Java, "class Main {}", &[("", "")]);
        let result = internal_failure(&submission, 3);
        assert!(result.error.is_some());
        assert!(result.verdicts.is_empty());
        assert_eq!(result.verdict, None);
        assert_eq!(result.aggregate.total, 1);
    }

    #[test]
    fn serialized_shape_is_stable() {
        let submission = judge_submission(Language::Python, "x", &[("2 7", "9")]);
        let result = format(
            &submission,
            &evaluation(EvaluationResult::Judged {
                verdicts: vec![verdict(0, VerdictKind::Passed, "9\n")],
            }),
        )
        .unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["version"], "v1");
        assert_eq!(json["verdict"], "Passed");
        assert_eq!(json["aggregate"]["passed"], 1);
        assert_eq!(json["aggregate"]["total"], 1);
        assert_eq!(json["verdicts"][0]["expectedOutput"], "9");
        assert_eq!(json["verdicts"][0]["status"], "completed");
        assert!(json["error"].is_null());
    }
}
