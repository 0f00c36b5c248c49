use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{pipeline::PipelineError, report::ReportError, scheduler::SubmitError};

/// Seconds a rejected caller is asked to wait before resubmitting.
const RETRY_AFTER_SECS: &str = "1";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("execution capacity exhausted, retry later")]
    Backpressure,
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("submission cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl EngineError {
    fn status(&self) -> StatusCode {
        match self {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Backpressure | EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retryable = matches!(self, EngineError::Backpressure);
        // Host detail is logged where the failure happened, never returned.
        let message = match &self {
            EngineError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let mut response = (
            status,
            Json(ErrorBody {
                error: message,
                retryable,
            }),
        )
            .into_response();
        if retryable {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

impl From<SubmitError> for EngineError {
    fn from(value: SubmitError) -> Self {
        match value {
            SubmitError::Backpressure { .. } => Self::Backpressure,
            SubmitError::ShuttingDown => Self::ShuttingDown,
        }
    }
}

impl From<PipelineError> for EngineError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::Cancelled => Self::Cancelled,
            PipelineError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<ReportError> for EngineError {
    fn from(value: ReportError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{value:#}"))
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        http::{StatusCode, header::RETRY_AFTER},
        response::IntoResponse,
    };

    use super::EngineError;
    use crate::engine::scheduler::SubmitError;

    #[test]
    fn backpressure_is_retryable_503() {
        let response = EngineError::from(SubmitError::Backpressure { capacity: 4 }).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let response = EngineError::Internal("fork: EAGAIN".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }
}
