//! Refresh-token exchange for the two credential flavours.

use chrono::{Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::credentials::{AuthMethod, Credential, RefreshedTokens};

pub const DEFAULT_SOCIAL_REFRESH_URL: &str = "https://prod.{region}.auth.desktop.kiro.dev/refreshToken";
pub const DEFAULT_IDC_REFRESH_URL: &str = "https://oidc.{region}.amazonaws.com/token";

#[derive(Debug, Clone)]
pub struct RefreshEndpoints {
    pub social_url: String,
    pub idc_url: String,
}

impl Default for RefreshEndpoints {
    fn default() -> Self {
        Self {
            social_url: DEFAULT_SOCIAL_REFRESH_URL.to_string(),
            idc_url: DEFAULT_IDC_REFRESH_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token itself was refused; the credential is unusable.
    #[error("refresh rejected: {0}")]
    Rejected(String),
    #[error("refresh failed: {0}")]
    Transient(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SocialRefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdcRefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    profile_arn: Option<String>,
}

pub fn region_url(template: &str, region: &str) -> String {
    template.replace("{region}", region)
}

pub async fn refresh_credential(
    client: &reqwest::Client,
    endpoints: &RefreshEndpoints,
    credential: &Credential,
    timeout_ms: u64,
) -> Result<RefreshedTokens, RefreshError> {
    if !credential.has_refresh_token() {
        return Err(RefreshError::Rejected("credential has no refresh token".to_string()));
    }

    let request = match credential.auth_method {
        AuthMethod::Social => {
            let url = region_url(&endpoints.social_url, &credential.region);
            client.post(url).json(&SocialRefreshRequest {
                refresh_token: &credential.refresh_token,
            })
        }
        AuthMethod::Idc => {
            let (Some(client_id), Some(client_secret)) = (
                credential.client_id.as_deref(),
                credential.client_secret.as_deref(),
            ) else {
                return Err(RefreshError::Rejected(
                    "idc refresh needs client_id and client_secret".to_string(),
                ));
            };
            let url = region_url(&endpoints.idc_url, &credential.region);
            client.post(url).json(&IdcRefreshRequest {
                client_id,
                client_secret,
                grant_type: "refresh_token",
                refresh_token: &credential.refresh_token,
            })
        }
    };

    let resp = request
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .send()
        .await
        .map_err(|err| RefreshError::Transient(err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let message = format!("refresh status {status}: {text}");
        return Err(if refresh_status_is_rejection(status) {
            RefreshError::Rejected(message)
        } else {
            RefreshError::Transient(message)
        });
    }

    let data: RefreshResponse = resp
        .json()
        .await
        .map_err(|err| RefreshError::Transient(err.to_string()))?;
    if data.access_token.trim().is_empty() {
        return Err(RefreshError::Transient(
            "refresh response carried an empty access token".to_string(),
        ));
    }

    tracing::info!(
        credential_id = %credential.id,
        auth_method = credential.auth_method.as_str(),
        expires_in = ?data.expires_in,
        "access token refreshed"
    );

    // IdC tokens never carry a profile ARN.
    let profile_arn = match credential.auth_method {
        AuthMethod::Social => data.profile_arn,
        AuthMethod::Idc => None,
    };
    Ok(RefreshedTokens {
        access_token: data.access_token,
        refresh_token: data.refresh_token.filter(|t| !t.trim().is_empty()),
        expires_at: data.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        profile_arn,
    })
}

fn refresh_status_is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}
