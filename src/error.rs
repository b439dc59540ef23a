use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::quota::QuotaDenial;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
    pub retry_after_secs: Option<u64>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
            retry_after_secs: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            .with_type("server_error")
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after_secs;
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        let mut resp = (self.status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        resp
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// One failed combo target and why it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub target: String,
    pub message: String,
}

/// Failure taxonomy of the request pipeline. Only the final, unrecoverable
/// condition of a request is surfaced to the client as one of these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid or disabled api key")]
    Unauthorized,
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaDenial),
    #[error("no upstream credential available, retry later")]
    NoCredentialAvailable,
    #[error("upstream rejected every credential tried: {0}")]
    UpstreamRejected(String),
    #[error("upstream unavailable: {0}")]
    UpstreamTransient(String),
    #[error("all combo targets failed: {}", format_target_failures(.0))]
    MappingFailureAllTargets(Vec<TargetFailure>),
    /// Upstream refused the request itself; status and error code pass
    /// through to the client.
    #[error("{message}")]
    UpstreamClient {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_target_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.target, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::QuotaExceeded(_) => "quota_exceeded",
            GatewayError::NoCredentialAvailable => "no_credential_available",
            GatewayError::UpstreamRejected(_) => "upstream_rejected",
            GatewayError::UpstreamTransient(_) => "upstream_unavailable",
            GatewayError::MappingFailureAllTargets(_) => "all_targets_failed",
            GatewayError::UpstreamClient { .. } => "upstream_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoCredentialAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamRejected(_)
            | GatewayError::UpstreamTransient(_)
            | GatewayError::MappingFailureAllTargets(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamClient { status, .. } => *status,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let error_type = match &err {
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::QuotaExceeded(_) => "rate_limit_error",
            GatewayError::UpstreamClient { .. } => "invalid_request_error",
            _ => "server_error",
        };
        let code = match &err {
            GatewayError::UpstreamClient {
                code: Some(code), ..
            } => code.clone(),
            _ => err.code().to_string(),
        };
        let app = AppError::new(err.status(), code, err.to_string()).with_type(error_type);
        match err {
            GatewayError::NoCredentialAvailable => app.with_retry_after(1),
            _ => app,
        }
    }
}
