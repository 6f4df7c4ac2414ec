use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum StorefrontError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("command `{command}` on {host} exited with status {status}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("linked file {path} missing on {host}")]
    MissingLinkedFile { host: String, path: String },

    #[error("deploy lock {lock} already held on {host}")]
    DeployLocked { host: String, lock: String },

    #[error("stage {stage} timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("stage {stage} failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<StorefrontError>,
    },

    #[error("no pipeline stage named `{0}` to hook onto")]
    UnknownAnchor(String),

    #[error("no previous release to roll back to")]
    NoPreviousRelease,

    #[error("{model} does not enable {capability}")]
    CapabilityDisabled {
        model: &'static str,
        capability: String,
    },

    #[error("extension `{0}` registered twice")]
    DuplicateExtension(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors worth retrying after a short backoff.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for StorefrontError {
    fn is_retryable(&self) -> bool {
        match self {
            StorefrontError::Unreachable { .. } => true,
            StorefrontError::Reqwest(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

impl StorefrontError {
    /// Name of the pipeline stage the failure happened in, if any.
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            StorefrontError::StageFailed { stage, .. }
            | StorefrontError::StageTimeout { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl IntoResponse for StorefrontError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match &self {
            StorefrontError::Reqwest(e) if e.is_timeout() => (
                StatusCode::GATEWAY_TIMEOUT,
                "GATEWAY_TIMEOUT",
                "Commerce engine did not answer in time.",
            ),
            StorefrontError::Reqwest(_) => (
                StatusCode::BAD_GATEWAY,
                "BAD_GATEWAY",
                "Commerce engine is unavailable.",
            ),
            StorefrontError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", "Request could not be read.")
            }
            StorefrontError::CapabilityDisabled { .. } => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "No route matches.")
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal server error occurred.",
            ),
        };
        let body = ApiErrorResponse {
            error: ApiErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Standardized API error response body
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}
