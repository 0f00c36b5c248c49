use std::{collections::HashMap, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use uuid::Uuid;

use crate::engine::{
    catalog::ProblemCatalog,
    config::EngineConfig,
    error::EngineError,
    language::{adapter_for, validate_args, validate_flags},
    metrics::MetricsRegistry,
    models::{ExecuteRequest, Language, LanguageInfo, ProblemId, Submission, SubmissionMode},
    pipeline::PipelineError,
    report::{self, ExecutionResult},
    scheduler::Scheduler,
};

const MAX_CODE_BYTES: usize = 256 * 1024;
const MAX_STDIN_BYTES: usize = 1024 * 1024;
const MAX_TEST_CASES: usize = 256;
const MAX_CASE_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    config: Arc<EngineConfig>,
    scheduler: Scheduler,
    catalog: Arc<dyn ProblemCatalog>,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(
    config: Arc<EngineConfig>,
    scheduler: Scheduler,
    catalog: Arc<dyn ProblemCatalog>,
    metrics_registry: Arc<MetricsRegistry>,
) -> Router {
    let state = AppState {
        config,
        scheduler,
        catalog,
        metrics: metrics_registry,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/api/execute", post(execute))
        .route("/api/languages", get(languages))
        .route("/api/problems/{id}/boilerplate", get(boilerplate))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "availableCapacity": state.scheduler.available(),
    }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn languages(State(state): State<AppState>) -> Json<Vec<LanguageInfo>> {
    Json(
        Language::ALL
            .into_iter()
            .map(|language| LanguageInfo {
                language,
                compiled: adapter_for(language).compiled(),
                limits: state.config.limits_for(language),
            })
            .collect(),
    )
}

async fn boilerplate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HashMap<Language, String>>, EngineError> {
    let id = ProblemId(id);
    state
        .catalog
        .boilerplate(&id)
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("problem {id}")))
}

/// Admits the submission and waits for its result. If the client goes
/// away first, the drop guard cancels the submission and frees its slot.
async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecutionResult>), EngineError> {
    validate_request(&request)?;
    let submission = build_submission(state.catalog.as_ref(), request)?;
    let started = Instant::now();

    let handle = state.scheduler.submit(submission.clone())?;
    tracing::debug!(submission_id = %handle.id(), mode = submission.mode.label(), "submission admitted");
    let guard = handle.cancellation().drop_guard();
    let result = handle.wait().await;
    guard.disarm();

    match result {
        Ok(evaluation) => {
            let result = report::format(&submission, &evaluation).inspect_err(|err| {
                tracing::error!(submission_id = %submission.id, error = %err, "failed to format result");
            })?;
            let status = if result.is_compile_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::OK
            };
            Ok((status, Json(result)))
        }
        Err(PipelineError::Internal(_)) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(report::internal_failure(&submission, elapsed_ms)),
            ))
        }
        Err(err) => Err(err.into()),
    }
}

fn validate_request(request: &ExecuteRequest) -> Result<(), EngineError> {
    if request.code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("code is empty".to_string()));
    }
    if request.code.len() > MAX_CODE_BYTES {
        return Err(EngineError::InvalidRequest("code too large".to_string()));
    }
    if request.stdin.as_ref().is_some_and(|s| s.len() > MAX_STDIN_BYTES) {
        return Err(EngineError::InvalidRequest("stdin too large".to_string()));
    }
    if request.test_cases.len() > MAX_TEST_CASES {
        return Err(EngineError::InvalidRequest(format!(
            "too many test cases; max is {MAX_TEST_CASES}"
        )));
    }
    if request
        .test_cases
        .iter()
        .any(|case| case.input.len() > MAX_CASE_BYTES || case.expected_output.len() > MAX_CASE_BYTES)
    {
        return Err(EngineError::InvalidRequest("test case too large".to_string()));
    }
    validate_flags(&request.compiler_flags).map_err(EngineError::InvalidRequest)?;
    validate_args(&request.args).map_err(EngineError::InvalidRequest)?;
    Ok(())
}

/// Explicit stdin wins, then inline test cases, then the problem's cases.
/// Without any of them the program runs once on empty input.
fn build_submission(
    catalog: &dyn ProblemCatalog,
    request: ExecuteRequest,
) -> Result<Submission, EngineError> {
    let language: Language = request
        .language
        .parse()
        .map_err(EngineError::InvalidRequest)?;

    let mode = match (request.stdin, request.test_cases.is_empty(), &request.problem_id) {
        (Some(stdin), _, _) => SubmissionMode::Run { stdin },
        (None, false, _) => SubmissionMode::Judge {
            test_cases: request.test_cases,
        },
        (None, true, Some(problem_id)) => {
            let test_cases = catalog
                .test_cases(problem_id)
                .ok_or_else(|| EngineError::NotFound(format!("problem {problem_id}")))?;
            let offered = catalog.languages(problem_id).unwrap_or_default();
            if !offered.contains(&language) {
                return Err(EngineError::InvalidRequest(format!(
                    "problem {problem_id} is not offered in {language}"
                )));
            }
            if test_cases.is_empty() {
                return Err(EngineError::InvalidRequest(format!(
                    "problem {problem_id} has no test cases"
                )));
            }
            SubmissionMode::Judge { test_cases }
        }
        (None, true, None) => SubmissionMode::Run {
            stdin: String::new(),
        },
    };

    Ok(Submission {
        id: Uuid::new_v4(),
        language,
        source: request.code,
        compiler_flags: request.compiler_flags,
        args: request.args,
        problem_id: request.problem_id,
        mode,
        accepted_at: Utc::now(),
    })
}
