mod compare;
mod verdict;

use futures_util::{FutureExt, StreamExt, future::BoxFuture, stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    language::ExecutableUnit,
    models::{ExecutionLimits, TestCase},
    sandbox::{RunStatus, SandboxBackend},
};

pub use compare::Comparator;
pub use verdict::{Verdict, VerdictKind, worst};

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub comparator: Comparator,
    /// Stop at the first test case that does not pass.
    pub fail_fast: bool,
    /// Test cases of one submission run concurrently up to this many at a
    /// time. Every run still gets its own process group and scratch dir.
    pub parallelism: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            comparator: Comparator::default(),
            fail_fast: false,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("sandbox failure on test case {index}: {message}")]
    Internal { index: usize, message: String },
}

/// Runs every test case once against `unit` and judges its output.
///
/// Verdicts come back in the order the cases were supplied. Cases still
/// pending when `cancel` fires are reported as [`VerdictKind::Timeout`]
/// without an outcome. With `fail_fast`, nothing after the first failing
/// case is reported.
pub async fn evaluate(
    sandbox: &dyn SandboxBackend,
    unit: &ExecutableUnit,
    cases: &[TestCase],
    limits: &ExecutionLimits,
    config: &HarnessConfig,
    cancel: &CancellationToken,
) -> Result<Vec<Verdict>, HarnessError> {
    // Keep these boxed; the evaluation future is spawned and must be `Send`.
    let runs: Vec<BoxFuture<'_, Result<Verdict, HarnessError>>> = cases
        .iter()
        .enumerate()
        .map(|(index, case)| run_case(sandbox, unit, index, case, limits, config, cancel).boxed())
        .collect();

    // `buffered` yields in submission order; dropping the stream early
    // drops in-flight runs, which kills their process groups.
    let mut results = stream::iter(runs).buffered(config.parallelism.max(1));
    let mut verdicts = Vec::with_capacity(cases.len());
    while let Some(result) = results.next().await {
        let verdict = result?;
        let stop = config.fail_fast && !verdict.passed();
        verdicts.push(verdict);
        if stop {
            break;
        }
    }
    Ok(verdicts)
}

async fn run_case(
    sandbox: &dyn SandboxBackend,
    unit: &ExecutableUnit,
    index: usize,
    case: &TestCase,
    limits: &ExecutionLimits,
    config: &HarnessConfig,
    cancel: &CancellationToken,
) -> Result<Verdict, HarnessError> {
    if cancel.is_cancelled() {
        return Ok(Verdict {
            index,
            kind: VerdictKind::Timeout,
            outcome: None,
        });
    }
    let request = unit.invoke(case.input.as_bytes(), limits);
    let outcome = sandbox.execute(request, cancel).await;
    if outcome.status == RunStatus::InternalError {
        return Err(HarnessError::Internal {
            index,
            message: outcome.stderr,
        });
    }
    let kind = if cancel.is_cancelled() && outcome.status == RunStatus::TimedOut {
        VerdictKind::Timeout
    } else {
        VerdictKind::judge(&outcome, &case.expected_output, &config.comparator)
            .unwrap_or(VerdictKind::RuntimeError)
    };
    tracing::debug!(
        language = %unit.language(),
        test_case = index,
        verdict = ?kind,
        status = ?outcome.status,
        wall_time_ms = outcome.wall_time_ms,
        "test case judged"
    );
    Ok(Verdict {
        index,
        kind,
        outcome: Some(outcome),
    })
}
