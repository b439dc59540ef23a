use axum::http::HeaderMap;

use crate::accounts::{Account, AccountStore, LOGIN_TOKEN_PREFIX};
use crate::error::GatewayError;

/// Opaque bearer value from `Authorization`, falling back to `x-api-key`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let from_auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        });
    from_auth
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves an API key to its active account.
pub async fn authenticate_api_key(
    headers: &HeaderMap,
    accounts: &AccountStore,
) -> Result<Account, GatewayError> {
    let token = bearer_token(headers).ok_or(GatewayError::Unauthorized)?;
    match accounts.lookup_api_key(token).await {
        Ok(Some(account)) => Ok(account),
        Ok(None) => Err(GatewayError::Unauthorized),
        Err(err) => Err(GatewayError::Internal(err)),
    }
}

/// Resolves a self-service login token to its active account.
pub async fn authenticate_login_token(
    headers: &HeaderMap,
    accounts: &AccountStore,
) -> Result<Account, GatewayError> {
    let token = bearer_token(headers).ok_or(GatewayError::Unauthorized)?;
    if !token.starts_with(LOGIN_TOKEN_PREFIX) {
        return Err(GatewayError::Unauthorized);
    }
    match accounts.find_by_login_token(token).await {
        Ok(Some(account)) => Ok(account),
        Ok(None) => Err(GatewayError::Unauthorized),
        Err(err) => Err(GatewayError::Internal(err)),
    }
}
