//! Self-service routes, authenticated with the account's login token.

use crate::app::AppState;
use crate::auth::authenticate_login_token;
use crate::error::{AppError, AppResult};
use crate::mappings::MappingKind;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

fn store_error(err: String) -> AppError {
    AppError::internal(err)
}

pub async fn get_me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let account = authenticate_login_token(&headers, &state.account_store).await?;
    let keys = state
        .account_store
        .list_api_keys(&account.id)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({
        "id": account.id,
        "name": account.name,
        "status": account.status,
        "balance": account.balance,
        "granted_total": account.granted_total,
        "quota": account.quota,
        "request_count": account.request_count,
        "flagged_for_review": account.flagged_for_review,
        "apikeys_count": keys.len(),
        "created_at": account.created_at,
        "last_used": account.last_used,
    })))
}

pub async fn list_apikeys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let account = authenticate_login_token(&headers, &state.account_store).await?;
    let keys = state
        .account_store
        .list_api_keys(&account.id)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "apikeys": keys })))
}

pub async fn create_apikey(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let account = authenticate_login_token(&headers, &state.account_store).await?;
    let (info, key) = state
        .account_store
        .issue_api_key(&account.id)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "apikey": key, "info": info })))
}

#[derive(Debug, Deserialize)]
pub struct RevokeApiKeyRequest {
    #[serde(default)]
    pub apikey: String,
}

pub async fn revoke_apikey(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RevokeApiKeyRequest>,
) -> AppResult<Json<Value>> {
    let account = authenticate_login_token(&headers, &state.account_store).await?;
    let apikey = req.apikey.trim();
    if apikey.is_empty() {
        return Err(
            AppError::new(StatusCode::BAD_REQUEST, "invalid_request", "apikey required")
                .with_param("apikey"),
        );
    }
    let revoked = state
        .account_store
        .revoke_api_key(&account.id, apikey)
        .await
        .map_err(store_error)?;
    if !revoked {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "API key not found",
        ));
    }
    tracing::info!(account_id = %account.id, "api key revoked");
    Ok(Json(json!({ "ok": true })))
}

pub async fn get_usage(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let account = authenticate_login_token(&headers, &state.account_store).await?;
    let summary = state
        .usage_store
        .account_summary(&account.id)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({
        "account_id": account.id,
        "balance": account.balance,
        "granted_total": account.granted_total,
        "usage": summary,
    })))
}

pub async fn list_combos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    authenticate_login_token(&headers, &state.account_store).await?;
    let combos: Vec<_> = state
        .mapping_store
        .list()
        .await
        .map_err(store_error)?
        .into_iter()
        .filter(|m| m.kind == MappingKind::Combo)
        .collect();
    Ok(Json(json!({ "combos": combos })))
}
