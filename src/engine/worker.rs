use std::sync::Arc;

use tokio::sync::{Mutex, mpsc::Receiver};

use crate::engine::{
    metrics::MetricsRegistry,
    pipeline::{EvaluationResult, Pipeline, PipelineError},
    scheduler::{Evaluation, JobResult, QueuedJob},
};

pub fn spawn_worker_pool(
    workers: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsRegistry>,
    internal_retries: u32,
) {
    for worker_id in 0..workers.max(1) {
        let receiver = receiver.clone();
        let pipeline = pipeline.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            worker_loop(worker_id, receiver, pipeline, metrics, internal_retries).await;
        });
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsRegistry>,
    internal_retries: u32,
) {
    loop {
        let job = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(job) = job else {
            tracing::info!(worker_id, "submission queue closed, worker exiting");
            break;
        };

        let submission_id = job.submission.id;
        tracing::info!(
            worker_id,
            submission_id = %submission_id,
            language = %job.submission.language,
            accepted_at = %job.submission.accepted_at,
            queued_ms = job.enqueued_at.elapsed().as_millis() as u64,
            sandbox = pipeline.sandbox_name(),
            "starting submission"
        );
        metrics.started();

        let result = if job.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            run_with_retries(worker_id, &job, &pipeline, &metrics, internal_retries).await
        };
        record(worker_id, &job, &result, &metrics);
        metrics.finished();

        if job.reply.send(result).is_err() {
            tracing::debug!(worker_id, submission_id = %submission_id, "caller went away before the result");
        }
    }
}

/// Sandbox failures are retried; anything the submission itself caused is not.
async fn run_with_retries(
    worker_id: usize,
    job: &QueuedJob,
    pipeline: &Arc<Pipeline>,
    metrics: &MetricsRegistry,
    internal_retries: u32,
) -> JobResult {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match run_once(job, pipeline).await {
            Ok(result) => {
                return Ok(Evaluation {
                    result,
                    elapsed_ms: job.enqueued_at.elapsed().as_millis() as u64,
                    attempts,
                });
            }
            Err(PipelineError::Internal(message))
                if attempts <= internal_retries && !job.cancel.is_cancelled() =>
            {
                metrics.retried();
                tracing::warn!(
                    worker_id,
                    submission_id = %job.submission.id,
                    attempt = attempts,
                    error = %message,
                    "internal error, retrying submission"
                );
            }
            Err(err) => return Err(err),
        }
    }
}

/// One attempt under the submission deadline. The deadline only cancels the
/// runs; the evaluation is still awaited so every process is reaped and the
/// remaining cases are reported as timeouts.
async fn run_once(job: &QueuedJob, pipeline: &Arc<Pipeline>) -> Result<EvaluationResult, PipelineError> {
    let deadline = pipeline.deadline_for(&job.submission);
    let run_token = job.cancel.child_token();
    let mut task = tokio::spawn({
        let pipeline = pipeline.clone();
        let submission = job.submission.clone();
        let token = run_token.clone();
        async move { pipeline.evaluate(&submission, &token).await }
    });

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::time::sleep(deadline) => {
            tracing::warn!(
                submission_id = %job.submission.id,
                deadline_ms = deadline.as_millis() as u64,
                "submission deadline exceeded, cancelling runs"
            );
            run_token.cancel();
            (&mut task).await
        }
    };

    if job.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    joined.unwrap_or_else(|err| Err(PipelineError::Internal(format!("evaluation task failed: {err}"))))
}

fn record(worker_id: usize, job: &QueuedJob, result: &JobResult, metrics: &MetricsRegistry) {
    let submission_id = job.submission.id;
    match result {
        Ok(evaluation) => {
            let outcome = match &evaluation.result {
                EvaluationResult::CompileError { .. } => {
                    metrics.compile_error();
                    "compile_error"
                }
                other if other.timed_out() => {
                    metrics.timed_out();
                    "timed_out"
                }
                EvaluationResult::Judged { .. } => "judged",
                EvaluationResult::Ran { .. } => "ran",
            };
            tracing::info!(
                worker_id,
                submission_id = %submission_id,
                outcome,
                attempts = evaluation.attempts,
                elapsed_ms = evaluation.elapsed_ms,
                "submission finished"
            );
        }
        Err(PipelineError::Cancelled) => {
            metrics.cancelled();
            tracing::info!(worker_id, submission_id = %submission_id, "submission cancelled");
        }
        Err(PipelineError::Internal(message)) => {
            metrics.internal_error();
            tracing::error!(
                worker_id,
                submission_id = %submission_id,
                error = %message,
                "submission failed with internal error"
            );
        }
    }
}
