use std::{sync::Arc, time::Instant};

use thiserror::Error;
use tokio::sync::{
    Mutex, OwnedSemaphorePermit, Semaphore,
    mpsc::{self, Receiver, Sender, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{
    metrics::MetricsRegistry,
    models::Submission,
    pipeline::{EvaluationResult, PipelineError},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("execution capacity exhausted ({capacity} submissions in flight or queued)")]
    Backpressure { capacity: usize },
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: EvaluationResult,
    /// Time from admission to completion, queueing included.
    pub elapsed_ms: u64,
    pub attempts: u32,
}

pub type JobResult = Result<Evaluation, PipelineError>;

#[derive(Debug)]
pub struct QueuedJob {
    pub submission: Submission,
    pub cancel: CancellationToken,
    pub enqueued_at: Instant,
    pub reply: oneshot::Sender<JobResult>,
    /// Returned to the admission pool when the job is dropped, which is
    /// after the worker has replied or the job was abandoned.
    _permit: OwnedSemaphorePermit,
}

/// Admission control in front of the worker pool.
///
/// `slots + queue_depth` submissions may be admitted at once; the workers
/// take them off the channel in FIFO order. Anything beyond that is
/// rejected immediately with [`SubmitError::Backpressure`].
#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<QueuedJob>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    admission: Arc<Semaphore>,
    capacity: usize,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    pub fn new(slots: usize, queue_depth: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let capacity = slots.max(1).saturating_add(queue_depth);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
            metrics,
        }
    }

    pub fn submit(&self, submission: Submission) -> Result<SubmissionHandle, SubmitError> {
        let Ok(permit) = self.admission.clone().try_acquire_owned() else {
            self.metrics.rejected();
            tracing::warn!(
                submission_id = %submission.id,
                capacity = self.capacity,
                "submission rejected, capacity exhausted"
            );
            return Err(SubmitError::Backpressure {
                capacity: self.capacity,
            });
        };

        let id = submission.id;
        let cancel = CancellationToken::new();
        let (reply, result) = oneshot::channel();
        let job = QueuedJob {
            submission,
            cancel: cancel.clone(),
            enqueued_at: Instant::now(),
            reply,
            _permit: permit,
        };
        match self.sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.rejected();
                return Err(SubmitError::Backpressure {
                    capacity: self.capacity,
                });
            }
            Err(TrySendError::Closed(_)) => return Err(SubmitError::ShuttingDown),
        }
        self.metrics.submitted();
        tracing::debug!(submission_id = %id, "submission queued");
        Ok(SubmissionHandle { id, cancel, result })
    }

    pub fn available(&self) -> usize {
        self.admission.available_permits()
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<QueuedJob>>> {
        self.receiver.clone()
    }
}

/// Caller's side of an admitted submission.
#[derive(Debug)]
pub struct SubmissionHandle {
    id: Uuid,
    cancel: CancellationToken,
    result: oneshot::Receiver<JobResult>,
}

impl SubmissionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kills any live sandboxed process of this submission and makes
    /// [`SubmissionHandle::wait`] resolve to [`PipelineError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> JobResult {
        self.result
            .await
            .unwrap_or_else(|_| Err(PipelineError::Internal("worker dropped the submission".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{Scheduler, SubmitError};
    use crate::engine::{
        config::EngineConfig,
        metrics::MetricsRegistry,
        models::Language,
        pipeline::{
            EvaluationResult, Pipeline, PipelineError,
            tests::{judge_submission, test_config},
        },
        sandbox::testing::ScriptedSandbox,
        worker::spawn_worker_pool,
    };

    fn start(slots: usize, queue_depth: usize, sandbox: Arc<ScriptedSandbox>) -> Scheduler {
        start_with(slots, queue_depth, sandbox, test_config())
    }

    fn start_with(
        slots: usize,
        queue_depth: usize,
        sandbox: Arc<ScriptedSandbox>,
        config: EngineConfig,
    ) -> Scheduler {
        let metrics = Arc::new(MetricsRegistry::new());
        let scheduler = Scheduler::new(slots, queue_depth, metrics.clone());
        let config = Arc::new(config);
        let pipeline = Arc::new(Pipeline::new(sandbox, config.clone()));
        spawn_worker_pool(slots, scheduler.receiver(), pipeline, metrics, config.internal_retries);
        scheduler
    }

    #[tokio::test]
    async fn rejects_the_submission_beyond_slots_and_queue_depth() {
        let scheduler = start(2, 0, ScriptedSandbox::slow(Duration::from_secs(30)));
        let first = scheduler
            .submit(judge_submission(Language::Bash, "cat", &[("", "")]))
            .unwrap();
        let second = scheduler
            .submit(judge_submission(Language::Bash, "cat", &[("", "")]))
            .unwrap();
        let third = scheduler.submit(judge_submission(Language::Bash, "cat", &[("", "")]));
        assert_eq!(third.unwrap_err(), SubmitError::Backpressure { capacity: 2 });

        first.cancel();
        second.cancel();
        assert_eq!(first.wait().await.unwrap_err(), PipelineError::Cancelled);
        assert_eq!(second.wait().await.unwrap_err(), PipelineError::Cancelled);
    }

    #[tokio::test]
    async fn capacity_is_released_after_completion() {
        let scheduler = start(1, 0, ScriptedSandbox::new(Vec::new()));
        for _ in 0..3 {
            let handle = scheduler
                .submit(judge_submission(Language::Bash, "cat", &[("7", "7")]))
                .unwrap();
            let evaluation = handle.wait().await.unwrap();
            assert!(matches!(evaluation.result, EvaluationResult::Judged { .. }));
            // the permit travels with the job and may be dropped just after the reply
            for _ in 0..100 {
                if scheduler.available() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(scheduler.available(), 1);
        }
    }

    #[tokio::test]
    async fn queued_submissions_wait_for_a_free_slot() {
        let scheduler = start(1, 2, ScriptedSandbox::new(Vec::new()));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let input = i.to_string();
                scheduler
                    .submit(judge_submission(Language::Bash, "cat", &[(&input, &input)]))
                    .unwrap()
            })
            .collect();
        assert!(scheduler
            .submit(judge_submission(Language::Bash, "cat", &[("", "")]))
            .is_err());
        for handle in handles {
            let evaluation = handle.wait().await.unwrap();
            let EvaluationResult::Judged { verdicts } = evaluation.result else {
                panic!("expected verdicts");
            };
            assert!(verdicts[0].passed());
        }
    }

    #[tokio::test]
    async fn deadline_cancels_remaining_runs_with_timeouts() {
        let mut config = test_config();
        config.max_submission_deadline_ms = 200;
        let sandbox = ScriptedSandbox::slow(Duration::from_secs(30));
        let scheduler = start_with(1, 0, sandbox.clone(), config);
        let handle = scheduler
            .submit(judge_submission(Language::Bash, "cat", &[("1", "1"), ("2", "2")]))
            .unwrap();
        let evaluation = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(evaluation.result.timed_out());
        let EvaluationResult::Judged { verdicts } = evaluation.result else {
            panic!("expected verdicts");
        };
        assert_eq!(verdicts.len(), 2);
    }
}
