use serde::Serialize;

use crate::engine::sandbox::{RunOutcome, RunStatus};

use super::Comparator;

/// Declaration order is severity order; the derived `Ord` relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum VerdictKind {
    Passed,
    WrongOutput,
    RuntimeError,
    Timeout,
    CompileError,
}

impl VerdictKind {
    /// Maps a finished run onto a verdict. Sandbox failures are not a
    /// property of the submission and have no verdict.
    pub fn judge(outcome: &RunOutcome, expected: &str, comparator: &Comparator) -> Option<Self> {
        let kind = match outcome.status {
            RunStatus::Completed if outcome.exit_code == Some(0) => {
                if comparator.matches(&outcome.stdout, expected) {
                    Self::Passed
                } else {
                    Self::WrongOutput
                }
            }
            RunStatus::Completed
            | RunStatus::CrashedSignal
            | RunStatus::MemoryExceeded
            | RunStatus::OutputExceeded => Self::RuntimeError,
            RunStatus::TimedOut => Self::Timeout,
            RunStatus::InternalError => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    /// Position of the test case in the order it was supplied.
    pub index: usize,
    pub kind: VerdictKind,
    /// `None` when the case never ran because the submission deadline passed.
    pub outcome: Option<RunOutcome>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.kind == VerdictKind::Passed
    }
}

/// The most severe verdict, preferring the earliest test case on ties.
pub fn worst(verdicts: &[Verdict]) -> Option<&Verdict> {
    verdicts.iter().fold(None, |worst, verdict| match worst {
        Some(current) if current.kind >= verdict.kind => Some(current),
        _ => Some(verdict),
    })
}

#[cfg(test)]
mod tests {
    use super::{Verdict, VerdictKind, worst};
    use crate::engine::{
        harness::Comparator,
        sandbox::{
            RunStatus,
            testing::{completed, with_status},
        },
    };

    fn verdict(index: usize, kind: VerdictKind) -> Verdict {
        Verdict {
            index,
            kind,
            outcome: None,
        }
    }

    #[test]
    fn completed_runs_are_compared() {
        let cmp = Comparator::Trimmed;
        assert_eq!(VerdictKind::judge(&completed("9\n", 0), "9", &cmp), Some(VerdictKind::Passed));
        assert_eq!(
            VerdictKind::judge(&completed("9\n", 0), "10", &cmp),
            Some(VerdictKind::WrongOutput)
        );
        assert_eq!(
            VerdictKind::judge(&completed("9\n", 1), "9", &cmp),
            Some(VerdictKind::RuntimeError)
        );
    }

    #[test]
    fn limit_violations_map_to_failures() {
        let cmp = Comparator::Trimmed;
        let judge = |status| VerdictKind::judge(&with_status(status), "", &cmp);
        assert_eq!(judge(RunStatus::TimedOut), Some(VerdictKind::Timeout));
        assert_eq!(judge(RunStatus::MemoryExceeded), Some(VerdictKind::RuntimeError));
        assert_eq!(judge(RunStatus::OutputExceeded), Some(VerdictKind::RuntimeError));
        assert_eq!(judge(RunStatus::CrashedSignal), Some(VerdictKind::RuntimeError));
        assert_eq!(judge(RunStatus::InternalError), None);
    }

    #[test]
    fn worst_prefers_severity_then_first_occurrence() {
        let verdicts = vec![
            verdict(0, VerdictKind::Passed),
            verdict(1, VerdictKind::WrongOutput),
            verdict(2, VerdictKind::Timeout),
            verdict(3, VerdictKind::RuntimeError),
            verdict(4, VerdictKind::Timeout),
        ];
        let worst = worst(&verdicts).unwrap();
        assert_eq!(worst.kind, VerdictKind::Timeout);
        assert_eq!(worst.index, 2);
    }

    #[test]
    fn worst_of_nothing_is_none() {
        assert!(worst(&[]).is_none());
    }
}
