use crate::app::AppState;
use crate::auth::authenticate_api_key;
use crate::error::{AppError, AppResult};
use crate::gateway::ChatReply;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response, Sse};
use axum::response::sse::Event;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::BTreeSet;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "apollo-gateway" }))
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    authenticate_api_key(&headers, &state.account_store).await?;
    let mappings = state
        .mapping_store
        .list()
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "mapping_store_error", e))?;

    let mut model_ids: BTreeSet<String> = BTreeSet::new();
    for mapping in mappings {
        model_ids.extend(mapping.targets);
        model_ids.insert(mapping.name);
    }

    let data: Vec<Value> = model_ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "apollo-gateway"
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let account = authenticate_api_key(&headers, &state.account_store).await?;
    let (model, stream) = validate_chat_body(&body)?;

    match state
        .gateway
        .chat_completions(&account, &model, body, stream)
        .await?
    {
        ChatReply::Complete(value) => Ok(Json(value).into_response()),
        ChatReply::Stream(rx) => {
            let events = tokio_stream::wrappers::ReceiverStream::new(rx)
                .map(Ok::<Event, std::convert::Infallible>);
            Ok(Sse::new(events).into_response())
        }
    }
}

fn validate_chat_body(body: &Value) -> AppResult<(String, bool)> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "invalid_request", "model is required")
                .with_param("model")
        })?;
    if !body.get("messages").is_some_and(|v| v.is_array()) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "messages must be an array",
        )
        .with_param("messages"));
    }
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    Ok((model.to_string(), stream))
}
