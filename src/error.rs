use crate::{interactions::LogError, validate::SchemaViolation};
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON body returned for every non-2xx response.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    BadJson(#[from] JsonRejection),
    #[error(transparent)]
    BadQuery(#[from] QueryRejection),
    #[error("invalid request: {0}")]
    Validation(#[from] SchemaViolation),
    #[error("{context}: {source}")]
    Log {
        context: &'static str,
        #[source]
        source: LogError,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn log(context: &'static str) -> impl FnOnce(LogError) -> ApiError {
        move |source| ApiError::Log { context, source }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadJson(rejection) => rejection.status(),
            ApiError::BadQuery(rejection) => rejection.status(),
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Log { .. } | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, detail) = match &self {
            ApiError::BadJson(rejection) => ("Invalid request body".to_string(), rejection.body_text()),
            ApiError::BadQuery(rejection) => ("Invalid query string".to_string(), rejection.body_text()),
            ApiError::Validation(v) => ("Invalid request".to_string(), v.to_string()),
            ApiError::Log { context, source } => (context.to_string(), source.to_string()),
            ApiError::Internal(msg) => ("Internal server error".to_string(), msg.clone()),
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        } else {
            tracing::debug!(%status, error = %self, "rejected request");
        }
        let body = ErrorResponse { error, detail: Some(detail), timestamp: Utc::now() };
        (status, Json(body)).into_response()
    }
}
