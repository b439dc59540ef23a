use crate::credentials::Credential;
use crate::refresh::region_url;
use axum::http::StatusCode;
use serde_json::Value;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://q.{region}.amazonaws.com";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

/// How a failed call affects the credential and the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The upstream refused the credential (401/403).
    RejectedAuth,
    RateLimited,
    /// Network error, timeout or 5xx.
    Transient,
    /// Any other 4xx; the request itself is at fault.
    Client,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Timeout, None, message.into())
    }

    pub fn class(&self) -> FailureClass {
        match self.kind {
            UpstreamErrorKind::Network | UpstreamErrorKind::Timeout => FailureClass::Transient,
            UpstreamErrorKind::Http => match self.status {
                Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
                    FailureClass::RejectedAuth
                }
                Some(StatusCode::TOO_MANY_REQUESTS) => FailureClass::RateLimited,
                Some(StatusCode::REQUEST_TIMEOUT) => FailureClass::Transient,
                Some(status) if status.is_server_error() => FailureClass::Transient,
                Some(_) => FailureClass::Client,
                // Undecodable success body.
                None => FailureClass::Transient,
            },
        }
    }
}

fn map_send_error(err: reqwest::Error) -> UpstreamCallError {
    let kind = if err.is_timeout() {
        UpstreamErrorKind::Timeout
    } else {
        UpstreamErrorKind::Network
    };
    UpstreamCallError::new(kind, None, err.to_string())
}

/// Non-streaming chat completion; `timeout_ms` bounds the whole call.
pub async fn call_chat_completions(
    client: &reqwest::Client,
    base_url: &str,
    credential: &Credential,
    body: &Value,
    timeout_ms: u64,
) -> Result<Value, UpstreamCallError> {
    let resp = send_chat_completions(client, base_url, credential, body, Some(timeout_ms)).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        let mut mapped = map_send_error(err);
        mapped.status = Some(status);
        mapped
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(
            UpstreamErrorKind::Http,
            None,
            format!("invalid upstream json: {err}"),
        )
    })?;
    Ok(value)
}

/// Streaming chat completion. Only the wait for response headers is bounded
/// here; the body is read incrementally by the caller.
pub async fn call_chat_completions_stream(
    client: &reqwest::Client,
    base_url: &str,
    credential: &Credential,
    body: &Value,
    timeout_ms: u64,
) -> Result<reqwest::Response, UpstreamCallError> {
    let wait = std::time::Duration::from_millis(timeout_ms);
    match tokio::time::timeout(
        wait,
        send_chat_completions(client, base_url, credential, body, None),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(UpstreamCallError::timeout(format!(
            "no upstream response within {timeout_ms}ms"
        ))),
    }
}

async fn send_chat_completions(
    client: &reqwest::Client,
    base_url: &str,
    credential: &Credential,
    body: &Value,
    timeout_ms: Option<u64>,
) -> Result<reqwest::Response, UpstreamCallError> {
    let access_token = credential
        .access_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(StatusCode::UNAUTHORIZED),
                "credential has no access token".to_string(),
            )
        })?;
    let base = region_url(base_url, &credential.region);
    let url = join_url(&base, CHAT_COMPLETIONS_PATH);

    let mut req = client.post(url).bearer_auth(access_token).json(body);
    if let Some(timeout_ms) = timeout_ms {
        req = req.timeout(std::time::Duration::from_millis(timeout_ms));
    }
    if let Some(profile_arn) = credential.profile_arn.as_deref() {
        req = req.header("x-profile-arn", profile_arn);
    }

    let resp = req.send().await.map_err(map_send_error)?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
