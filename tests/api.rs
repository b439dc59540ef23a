use apollo_gateway::accounts::{Account, AccountQuota, AccountStatus, NewAccount};
use apollo_gateway::app::{AppState, RuntimeConfig};
use apollo_gateway::credentials::{CredentialStatus, NewCredential};
use apollo_gateway::mappings::{MappingError, MappingKind};
use apollo_gateway::quota::Admission;
use apollo_gateway::usage::NewUsageRecord;
use apollo_gateway::pool::{AcquireConstraints, PoolError, ReleaseOutcome};
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use chrono::Utc;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Debug, Clone)]
struct UpstreamCall {
    token: String,
    model: String,
    profile_arn: Option<String>,
}

#[derive(Default)]
struct MockUpstream {
    calls: Mutex<Vec<UpstreamCall>>,
    in_flight: Mutex<HashMap<String, usize>>,
    overlapped: AtomicBool,
    refreshes: Mutex<Vec<String>>,
}

impl MockUpstream {
    fn calls(&self) -> Vec<UpstreamCall> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_with_token(&self, token: &str) -> usize {
        self.calls().iter().filter(|c| c.token == token).count()
    }

    fn enter(&self, token: &str) {
        let mut lock = self.in_flight.lock().unwrap();
        let count = lock.entry(token.to_string()).or_insert(0);
        if *count > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        *count += 1;
    }

    fn leave(&self, token: &str) {
        let mut lock = self.in_flight.lock().unwrap();
        if let Some(count) = lock.get_mut(token) {
            *count = count.saturating_sub(1);
        }
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

fn completion_body(model: &str, with_usage: bool) -> Value {
    let mut body = json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": format!("echo from {model}") },
            "finish_reason": "stop"
        }]
    });
    if with_usage {
        body["usage"] = json!({ "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 });
    }
    body
}

fn content_chunk(model: &str, piece: &str) -> Event {
    Event::default().data(
        json!({
            "id": "chatcmpl-upstream",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": model,
            "choices": [{ "index": 0, "delta": { "content": piece }, "finish_reason": Value::Null }]
        })
        .to_string(),
    )
}

fn usage_chunk(model: &str) -> Event {
    Event::default().data(
        json!({
            "id": "chatcmpl-upstream",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": model,
            "choices": [],
            "usage": { "prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9 }
        })
        .to_string(),
    )
}

fn stream_response(model: &str, with_usage: bool) -> Response {
    let mut events: Vec<Result<Event, Infallible>> = Vec::new();
    for piece in ["Hel", "lo"] {
        events.push(Ok(content_chunk(model, piece)));
    }
    if with_usage {
        events.push(Ok(usage_chunk(model)));
    }
    events.push(Ok(Event::default().data("[DONE]")));
    Sse::new(futures_util::stream::iter(events)).into_response()
}

/// Eight content chunks 250ms apart, then usage and `[DONE]`.
fn slow_stream_response(model: &str) -> Response {
    let mut events: Vec<Event> = (0..8).map(|i| content_chunk(model, &format!("w{i} "))).collect();
    events.push(usage_chunk(model));
    events.push(Event::default().data("[DONE]"));
    let stream = futures_util::stream::iter(events).then(|event| async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok::<_, Infallible>(event)
    });
    Sse::new(stream).into_response()
}

/// Two content chunks, then the connection breaks without `[DONE]`.
fn cut_stream_response(model: &str) -> Response {
    let events: Vec<Result<Event, std::io::Error>> = vec![
        Ok(content_chunk(model, "Hel")),
        Ok(content_chunk(model, "lo")),
        Err(std::io::Error::other("connection reset")),
    ];
    let stream = futures_util::stream::iter(events).then(|event| async move {
        if event.is_err() {
            // Let the content chunks flush before the body fails.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        event
    });
    Sse::new(stream).into_response()
}

async fn chat_completions(
    State(mock): State<Arc<MockUpstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string();
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let stream = body.get("stream").and_then(|v| v.as_bool()) == Some(true);
    mock.calls.lock().unwrap().push(UpstreamCall {
        token: token.clone(),
        model: model.clone(),
        profile_arn: headers
            .get("x-profile-arn")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    match token.as_str() {
        "bad-token" => {
            return error_response(StatusCode::UNAUTHORIZED, "invalid_token", "token revoked");
        }
        "limited-token" => {
            return error_response(StatusCode::TOO_MANY_REQUESTS, "throttled", "slow down");
        }
        _ => {}
    }
    if model.starts_with("broken") {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "boom", "upstream exploded");
    }
    if model == "bad-request-model" {
        return error_response(
            StatusCode::BAD_REQUEST,
            "context_length_exceeded",
            "prompt too long",
        );
    }

    if stream && model == "slow-stream-model" {
        return slow_stream_response(&model);
    }
    if stream && model == "cut-stream-model" {
        return cut_stream_response(&model);
    }
    let with_usage = model != "no-usage-model";
    if stream {
        return stream_response(&model, with_usage);
    }
    if model == "slow-model" {
        mock.enter(&token);
        tokio::time::sleep(Duration::from_millis(300)).await;
        mock.leave(&token);
    }
    Json(completion_body(&model, with_usage)).into_response()
}

async fn refresh_token(
    State(mock): State<Arc<MockUpstream>>,
    Json(body): Json<Value>,
) -> Response {
    let refresh = body
        .get("refreshToken")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    mock.refreshes.lock().unwrap().push(refresh.clone());
    if refresh != "good-refresh" {
        return error_response(StatusCode::UNAUTHORIZED, "invalid_grant", "refresh token revoked");
    }
    Json(json!({
        "accessToken": "fresh-token",
        "refreshToken": "rotated-refresh",
        "expiresIn": 3600
    }))
    .into_response()
}

async fn start_upstream() -> (SocketAddr, Arc<MockUpstream>) {
    let mock = Arc::new(MockUpstream::default());
    let router = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/refreshToken", post(refresh_token))
        .route("/token", post(refresh_token))
        .with_state(Arc::clone(&mock));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, mock)
}

struct TestContext {
    router: Router,
    state: AppState,
    api_key: String,
    account: Account,
    upstream: Arc<MockUpstream>,
    _temp_dir: TempDir,
}

fn credential(access: &str, refresh: &str) -> NewCredential {
    NewCredential {
        refresh_token: refresh.to_string(),
        access_token: Some(access.to_string()),
        expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        ..NewCredential::default()
    }
}

async fn setup_with(credentials: Vec<NewCredential>, account: NewAccount) -> TestContext {
    let (upstream_addr, upstream) = start_upstream().await;
    let base_url = format!("http://{upstream_addr}");

    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("apollo.db");
    let state = apollo_gateway::app::load_state_with_runtime(RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        upstream_base_url: base_url.clone(),
        social_refresh_url: format!("{base_url}/refreshToken"),
        idc_refresh_url: format!("{base_url}/token"),
    })
    .await
    .expect("load state");

    let mut settings = state.settings_store.get_all().await.expect("settings");
    settings.retry_backoff_base_ms = 1;
    settings.retry_backoff_max_ms = 5;
    settings.request_timeout_ms = 5_000;
    state
        .settings_store
        .update_all(&settings)
        .await
        .expect("update settings");

    for input in credentials {
        state
            .credential_store
            .insert(input)
            .await
            .expect("insert credential");
    }

    let account = state
        .account_store
        .create_account(account)
        .await
        .expect("create account");
    let (_, api_key) = state
        .account_store
        .issue_api_key(&account.id)
        .await
        .expect("issue api key");

    TestContext {
        router: apollo_gateway::app::build_app(state.clone()),
        state,
        api_key,
        account,
        upstream,
        _temp_dir: temp_dir,
    }
}

fn funded_account() -> NewAccount {
    NewAccount {
        name: Some("tenant-1".to_string()),
        balance: 1_000_000,
        ..NewAccount::default()
    }
}

async fn setup() -> TestContext {
    setup_with(vec![credential("good-token", "good-refresh")], funded_account()).await
}

async fn send(
    ctx: &TestContext,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, String) {
    let mut req = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        req = req.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = match body {
        Some(body) => req
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

async fn chat(ctx: &TestContext, body: Value) -> (StatusCode, Value) {
    let (status, _, text) = send(
        ctx,
        "POST",
        "/v1/chat/completions",
        Some(&ctx.api_key),
        Some(body),
    )
    .await;
    let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    (status, value)
}

fn chat_body(model: &str) -> Value {
    json!({ "model": model, "messages": [{ "role": "user", "content": "hi" }] })
}

async fn current_account(ctx: &TestContext) -> Account {
    ctx.state
        .account_store
        .get(&ctx.account.id)
        .await
        .unwrap()
        .expect("account exists")
}

/// Stream accounting lands after the body ends, on the relay task.
async fn wait_for_usage_records(
    ctx: &TestContext,
    count: usize,
) -> Vec<apollo_gateway::usage::UsageRecord> {
    for _ in 0..250 {
        let records = ctx
            .state
            .usage_store
            .list_for_account(&ctx.account.id)
            .await
            .unwrap();
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("usage records never reached {count}");
}

/// Books usage outside the HTTP path, through a regular admission.
async fn record_usage(ctx: &TestContext, prompt_tokens: u64, completion_tokens: u64) {
    let account = current_account(ctx).await;
    let admission = ctx.state.quota.check(&account, 0).await.unwrap();
    let Admission::Admitted(reservation) = admission else {
        panic!("account should be admitted");
    };
    ctx.state
        .quota
        .commit(
            reservation,
            NewUsageRecord {
                account_id: account.id.clone(),
                model: "gpt-x".to_string(),
                prompt_tokens,
                completion_tokens,
                credential_id: None,
                estimated: false,
            },
            false,
        )
        .await
        .unwrap();
}

async fn wait_for_lease_release(ctx: &TestContext) -> apollo_gateway::credentials::Credential {
    for _ in 0..250 {
        let credentials = ctx.state.credential_store.list().await.unwrap();
        if credentials[0].lease_id.is_none() {
            return credentials[0].clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("lease never released");
}

async fn set_settings(
    ctx: &TestContext,
    apply: impl FnOnce(&mut apollo_gateway::settings::GatewaySettings),
) {
    let mut settings = ctx.state.settings_store.get_all().await.unwrap();
    apply(&mut settings);
    ctx.state.settings_store.update_all(&settings).await.unwrap();
}

#[tokio::test]
async fn unknown_or_missing_key_is_unauthorized() {
    let ctx = setup().await;
    let (status, _, body) = send(
        &ctx,
        "POST",
        "/v1/chat/completions",
        None,
        Some(chat_body("gpt-x")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("unauthorized"));

    let (status, _, _) = send(
        &ctx,
        "POST",
        "/v1/chat/completions",
        Some("ap-not-a-real-key"),
        Some(chat_body("gpt-x")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(ctx.upstream.calls().is_empty());
}

#[tokio::test]
async fn malformed_body_is_rejected_before_forwarding() {
    let ctx = setup().await;
    let (status, body) = chat(&ctx, json!({ "messages": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["param"], "model");
    assert!(ctx.upstream.calls().is_empty());
}

#[tokio::test]
async fn chat_completion_debits_account_and_records_usage() {
    let ctx = setup().await;
    let (status, body) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["model"], "gpt-x");
    assert_eq!(body["usage"]["total_tokens"], 30);

    let account = current_account(&ctx).await;
    assert_eq!(account.balance, 1_000_000 - 30);
    assert_eq!(account.request_count, 1);

    let records = ctx
        .state
        .usage_store
        .list_for_account(&ctx.account.id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt_tokens, 10);
    assert_eq!(records[0].completion_tokens, 20);
    assert!(!records[0].estimated);

    let credential_id = records[0].credential_id.clone().expect("credential id");
    let credential = ctx
        .state
        .credential_store
        .get(&credential_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credential.use_count, 1);
    assert!(credential.last_used.is_some());
    assert!(credential.lease_id.is_none());
    assert_eq!(credential.status, CredentialStatus::Active);
}

#[tokio::test]
async fn api_prefix_serves_the_same_routes() {
    let ctx = setup().await;
    let (status, _, body) = send(
        &ctx,
        "POST",
        "/api/v1/chat/completions",
        Some(&ctx.api_key),
        Some(chat_body("gpt-x")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("echo from gpt-x"));
}

#[tokio::test]
async fn alias_rewrites_the_upstream_model_only() {
    let ctx = setup().await;
    ctx.state
        .mapping_store
        .set("my-alias", MappingKind::Alias, vec!["upstream-a".to_string()])
        .await
        .unwrap();

    let (status, body) = chat(&ctx, chat_body("my-alias")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "my-alias");
    let calls = ctx.upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].model, "upstream-a");
}

#[tokio::test]
async fn combo_fails_over_to_next_target_and_bills_the_winner() {
    let ctx = setup().await;
    ctx.state
        .mapping_store
        .set(
            "my-combo",
            MappingKind::Combo,
            vec!["broken-model".to_string(), "good-model".to_string()],
        )
        .await
        .unwrap();

    let (status, body) = chat(&ctx, chat_body("my-combo")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["model"], "my-combo");

    let models: Vec<String> = ctx.upstream.calls().into_iter().map(|c| c.model).collect();
    assert_eq!(models, vec!["broken-model", "good-model"]);

    let records = ctx
        .state
        .usage_store
        .list_for_account(&ctx.account.id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].model, "good-model");

    // A transient target failure leaves the credential usable.
    let credentials = ctx.state.credential_store.list().await.unwrap();
    assert!(credentials.iter().all(|c| c.status == CredentialStatus::Active));
}

#[tokio::test]
async fn combo_reports_every_failed_target() {
    let ctx = setup().await;
    ctx.state
        .mapping_store
        .set(
            "doomed",
            MappingKind::Combo,
            vec!["broken-a".to_string(), "broken-b".to_string()],
        )
        .await
        .unwrap();

    let (status, body) = chat(&ctx, chat_body("doomed")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "all_targets_failed");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("broken-a"));
    assert!(message.contains("broken-b"));

    let records = ctx
        .state
        .usage_store
        .list_for_account(&ctx.account.id)
        .await
        .unwrap();
    assert!(records.is_empty());
    assert_eq!(current_account(&ctx).await.balance, 1_000_000);
}

#[tokio::test]
async fn rejected_credential_is_disabled_and_request_retried() {
    let ctx = setup_with(
        vec![
            credential("bad-token", "bad-refresh"),
            credential("good-token", "good-refresh"),
        ],
        funded_account(),
    )
    .await;

    // By the second call the never-used bad credential sorts first.
    for _ in 0..3 {
        let (status, body) = chat(&ctx, chat_body("gpt-x")).await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    assert_eq!(ctx.upstream.calls_with_token("bad-token"), 1);
    let credentials = ctx.state.credential_store.list().await.unwrap();
    let bad = credentials
        .iter()
        .find(|c| c.access_token.as_deref() == Some("bad-token"))
        .unwrap();
    assert_eq!(bad.status, CredentialStatus::Disabled);
    assert!(bad.last_error.is_some());
    assert!(bad.lease_id.is_none());

    let records = ctx
        .state
        .usage_store
        .list_for_account(&ctx.account.id)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn rate_limited_credential_cools_down_and_request_retried() {
    let ctx = setup_with(
        vec![
            credential("limited-token", "good-refresh"),
            credential("good-token", "good-refresh"),
        ],
        funded_account(),
    )
    .await;

    for _ in 0..2 {
        let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(ctx.upstream.calls_with_token("limited-token"), 1);
    let credentials = ctx.state.credential_store.list().await.unwrap();
    let limited = credentials
        .iter()
        .find(|c| c.access_token.as_deref() == Some("limited-token"))
        .unwrap();
    assert_eq!(limited.status, CredentialStatus::Exhausted);
    assert!(limited.cooldown_until.is_some_and(|at| at > Utc::now()));
}

#[tokio::test]
async fn only_rejected_credentials_surface_upstream_rejected() {
    let ctx = setup_with(vec![credential("bad-token", "bad-refresh")], funded_account()).await;
    let (status, body) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream_rejected");
    assert_eq!(ctx.upstream.calls_with_token("bad-token"), 1);
    assert_eq!(current_account(&ctx).await.balance, 1_000_000);
}

#[tokio::test]
async fn empty_pool_is_retryable_service_unavailable() {
    let ctx = setup_with(Vec::new(), funded_account()).await;
    let (status, headers, body) = send(
        &ctx,
        "POST",
        "/v1/chat/completions",
        Some(&ctx.api_key),
        Some(chat_body("gpt-x")),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("no_credential_available"));
    assert_eq!(
        headers.get("retry-after").and_then(|v| v.to_str().ok()),
        Some("1")
    );
}

#[tokio::test]
async fn upstream_client_error_passes_through_without_charge() {
    let ctx = setup().await;
    let (status, body) = chat(&ctx, chat_body("bad-request-model")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "context_length_exceeded");
    assert_eq!(ctx.upstream.calls().len(), 1);
    assert_eq!(current_account(&ctx).await.balance, 1_000_000);
    let credentials = ctx.state.credential_store.list().await.unwrap();
    assert_eq!(credentials[0].status, CredentialStatus::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_share_a_credential() {
    let ctx = setup_with(
        vec![
            credential("token-a", "good-refresh"),
            credential("token-b", "good-refresh"),
        ],
        funded_account(),
    )
    .await;

    let (r1, r2, r3) = tokio::join!(
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
    );
    let statuses = [r1.0, r2.0, r3.0];
    let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let unavailable = statuses
        .iter()
        .filter(|s| **s == StatusCode::SERVICE_UNAVAILABLE)
        .count();
    assert_eq!(ok, 2, "{statuses:?}");
    assert_eq!(unavailable, 1, "{statuses:?}");
    assert!(!ctx.upstream.overlapped.load(Ordering::SeqCst));
    assert_eq!(ctx.upstream.calls_with_token("token-a"), 1);
    assert_eq!(ctx.upstream.calls_with_token("token-b"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquire_wait_lets_queued_requests_through() {
    let ctx = setup_with(vec![credential("token-a", "good-refresh")], funded_account()).await;
    let mut settings = ctx.state.settings_store.get_all().await.unwrap();
    settings.acquire_wait_ms = 3_000;
    ctx.state.settings_store.update_all(&settings).await.unwrap();

    let (r1, r2) = tokio::join!(
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
    );
    assert_eq!(r1.0, StatusCode::OK);
    assert_eq!(r2.0, StatusCode::OK);
    assert!(!ctx.upstream.overlapped.load(Ordering::SeqCst));
    assert_eq!(ctx.upstream.calls_with_token("token-a"), 2);
}

#[tokio::test]
async fn pool_leases_are_exclusive() {
    let ctx = setup_with(
        vec![
            credential("token-a", "good-refresh"),
            credential("token-b", "good-refresh"),
        ],
        funded_account(),
    )
    .await;
    let settings = ctx.state.settings_store.get_all().await.unwrap();
    let constraints = AcquireConstraints::default();

    let first = ctx.state.pool.acquire(&constraints, &settings).await.unwrap();
    let second = ctx.state.pool.acquire(&constraints, &settings).await.unwrap();
    assert_ne!(first.credential_id(), second.credential_id());
    assert!(matches!(
        ctx.state.pool.acquire(&constraints, &settings).await,
        Err(PoolError::NoCredentialAvailable)
    ));

    let released = first.credential_id().to_string();
    ctx.state
        .pool
        .release(first, ReleaseOutcome::Success, &settings)
        .await
        .unwrap();
    let third = ctx.state.pool.acquire(&constraints, &settings).await.unwrap();
    assert_eq!(third.credential_id(), released);
}

#[tokio::test]
async fn daily_token_quota_rejects_requests_that_would_exceed_it() {
    let ctx = setup().await;
    ctx.state
        .account_store
        .set_quota(
            &ctx.account.id,
            AccountQuota {
                daily_tokens: 1000,
                ..AccountQuota::default()
            },
        )
        .await
        .unwrap();
    record_usage(&ctx, 250, 250).await;

    // Roughly 600 tokens of prompt on top of 500 already used today.
    let long_prompt = "apple ".repeat(600);
    let (status, body) = chat(
        &ctx,
        json!({ "model": "gpt-x", "messages": [{ "role": "user", "content": long_prompt }] }),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "{body}");
    assert_eq!(body["error"]["code"], "quota_exceeded");
    assert!(ctx.upstream.calls().is_empty());

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn daily_token_quota_binds_even_with_ample_balance() {
    let ctx = setup_with(
        vec![credential("good-token", "good-refresh")],
        NewAccount {
            name: Some("quota".to_string()),
            balance: 1000,
            quota: AccountQuota {
                daily_tokens: 500,
                ..AccountQuota::default()
            },
            ..NewAccount::default()
        },
    )
    .await;

    let long_prompt = "apple ".repeat(600);
    let (status, body) = chat(
        &ctx,
        json!({ "model": "gpt-x", "messages": [{ "role": "user", "content": long_prompt }] }),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"]["message"].as_str().unwrap().contains("daily token"));
    assert!(ctx.upstream.calls().is_empty());
    assert_eq!(current_account(&ctx).await.balance, 1000);
}

#[tokio::test]
async fn daily_request_quota_counts_calls() {
    let ctx = setup().await;
    ctx.state
        .account_store
        .set_quota(
            &ctx.account.id,
            AccountQuota {
                daily_requests: 1,
                ..AccountQuota::default()
            },
        )
        .await
        .unwrap();

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"]["message"].as_str().unwrap().contains("request"));
    assert_eq!(ctx.upstream.calls().len(), 1);
}

#[tokio::test]
async fn zero_quota_means_unlimited() {
    let ctx = setup().await;
    for _ in 0..5 {
        let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(current_account(&ctx).await.balance, 1_000_000 - 5 * 30);
}

#[tokio::test]
async fn overdraft_flags_account_and_blocks_next_request() {
    let ctx = setup_with(
        vec![credential("good-token", "good-refresh")],
        NewAccount {
            name: Some("tight".to_string()),
            balance: 10,
            ..NewAccount::default()
        },
    )
    .await;

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    let account = current_account(&ctx).await;
    assert_eq!(account.balance, -20);
    assert!(account.flagged_for_review);

    let (status, body) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "quota_exceeded");
    assert_eq!(ctx.upstream.calls().len(), 1);
}

#[tokio::test]
async fn disabled_account_keys_stop_working() {
    let ctx = setup().await;
    ctx.state
        .account_store
        .set_status(&ctx.account.id, AccountStatus::Disabled)
        .await
        .unwrap();
    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(ctx.upstream.calls().is_empty());
}

#[tokio::test]
async fn expired_access_token_is_refreshed_and_persisted() {
    let ctx = setup_with(
        vec![NewCredential {
            refresh_token: "good-refresh".to_string(),
            access_token: Some("expired-token".to_string()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            profile_arn: Some("arn:aws:codewhisperer:us-east-1:1:profile/P".to_string()),
            ..NewCredential::default()
        }],
        funded_account(),
    )
    .await;

    let (status, body) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let calls = ctx.upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].token, "fresh-token");
    assert_eq!(
        calls[0].profile_arn.as_deref(),
        Some("arn:aws:codewhisperer:us-east-1:1:profile/P")
    );
    assert_eq!(
        ctx.upstream.refreshes.lock().unwrap().clone(),
        vec!["good-refresh".to_string()]
    );

    let stored = ctx.state.credential_store.list().await.unwrap();
    assert_eq!(stored[0].access_token.as_deref(), Some("fresh-token"));
    assert_eq!(stored[0].refresh_token, "rotated-refresh");
    assert!(stored[0].expires_at.is_some_and(|at| at > Utc::now()));
}

#[tokio::test]
async fn revoked_refresh_token_disables_the_credential() {
    let ctx = setup_with(
        vec![NewCredential {
            refresh_token: "revoked-refresh".to_string(),
            access_token: Some("expired-token".to_string()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..NewCredential::default()
        }],
        funded_account(),
    )
    .await;

    let (status, body) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream_rejected");
    assert!(ctx.upstream.calls().is_empty());
    let stored = ctx.state.credential_store.list().await.unwrap();
    assert_eq!(stored[0].status, CredentialStatus::Disabled);
}

#[tokio::test]
async fn idc_credentials_refresh_against_the_oidc_endpoint() {
    let ctx = setup_with(
        vec![NewCredential {
            refresh_token: "good-refresh".to_string(),
            access_token: None,
            expires_at: None,
            auth_method: Some("idc".to_string()),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            ..NewCredential::default()
        }],
        funded_account(),
    )
    .await;

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.upstream.calls()[0].token, "fresh-token");
}

#[tokio::test]
async fn nonstream_usage_is_estimated_when_upstream_omits_it() {
    let ctx = setup().await;
    let (status, body) = chat(&ctx, chat_body("no-usage-model")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);

    let records = ctx
        .state
        .usage_store
        .list_for_account(&ctx.account.id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].estimated);
    assert!(records[0].prompt_tokens > 0);
    assert!(records[0].completion_tokens > 0);
}

#[tokio::test]
async fn stream_is_relayed_and_committed_after_completion() {
    let ctx = setup().await;
    let mut body = chat_body("gpt-x");
    body["stream"] = json!(true);
    let (status, headers, text) = send(
        &ctx,
        "POST",
        "/v1/chat/completions",
        Some(&ctx.api_key),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"))
    );
    assert!(text.contains("Hel"));
    assert!(text.contains("\"model\":\"gpt-x\""));
    assert!(text.contains("[DONE]"));

    let records = wait_for_usage_records(&ctx, 1).await;
    assert_eq!(records[0].prompt_tokens, 7);
    assert_eq!(records[0].completion_tokens, 2);
    assert!(!records[0].estimated);

    for _ in 0..100 {
        let credentials = ctx.state.credential_store.list().await.unwrap();
        if credentials[0].lease_id.is_none() {
            assert_eq!(credentials[0].use_count, 1);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("stream lease never released");
}

#[tokio::test]
async fn stream_without_usage_gets_an_estimated_usage_chunk() {
    let ctx = setup().await;
    let mut body = chat_body("no-usage-model");
    body["stream"] = json!(true);
    let (status, _, text) = send(
        &ctx,
        "POST",
        "/v1/chat/completions",
        Some(&ctx.api_key),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("\"usage\""));

    let records = wait_for_usage_records(&ctx, 1).await;
    assert!(records[0].estimated);
    assert!(records[0].completion_tokens > 0);
}

#[tokio::test]
async fn stream_failure_before_headers_returns_http_error() {
    let ctx = setup_with(vec![credential("bad-token", "bad-refresh")], funded_account()).await;
    let mut body = chat_body("gpt-x");
    body["stream"] = json!(true);
    let (status, body) = chat(&ctx, body).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream_rejected");
}

#[tokio::test]
async fn models_lists_mapping_names_and_targets() {
    let ctx = setup().await;
    ctx.state
        .mapping_store
        .set("my-alias", MappingKind::Alias, vec!["upstream-a".to_string()])
        .await
        .unwrap();

    let (status, _, text) = send(&ctx, "GET", "/v1/models", Some(&ctx.api_key), None).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    for expected in ["kiro-auto", "auto-kiro", "my-alias", "upstream-a"] {
        assert!(ids.contains(&expected), "missing {expected} in {ids:?}");
    }

    let (status, _, _) = send(&ctx, "GET", "/v1/models", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn user_routes_manage_keys_and_report_usage() {
    let ctx = setup().await;
    let login = ctx.account.login_token.clone();

    let (status, _, text) = send(&ctx, "GET", "/user/me", Some(&login), None).await;
    assert_eq!(status, StatusCode::OK);
    let me: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(me["name"], "tenant-1");
    assert_eq!(me["apikeys_count"], 1);

    // API keys are not login tokens.
    let (status, _, _) = send(&ctx, "GET", "/user/me", Some(&ctx.api_key), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, text) = send(&ctx, "POST", "/user/apikeys", Some(&login), None).await;
    assert_eq!(status, StatusCode::OK);
    let created: Value = serde_json::from_str(&text).unwrap();
    let new_key = created["apikey"].as_str().unwrap().to_string();

    let (status, _, _) = send(&ctx, "GET", "/v1/models", Some(&new_key), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, text) = send(&ctx, "GET", "/user/apikeys", Some(&login), None).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(listed["apikeys"].as_array().unwrap().len(), 2);
    assert!(!text.contains(&new_key));

    let (status, _, _) = send(
        &ctx,
        "DELETE",
        "/user/apikeys",
        Some(&login),
        Some(json!({ "apikey": new_key })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&ctx, "GET", "/v1/models", Some(&new_key), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(
        &ctx,
        "DELETE",
        "/user/apikeys",
        Some(&login),
        Some(json!({ "apikey": new_key })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, text) = send(&ctx, "GET", "/user/usage", Some(&login), None).await;
    assert_eq!(status, StatusCode::OK);
    let usage: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(usage["usage"]["total_tokens"], 30);
    assert_eq!(usage["usage"]["total_requests"], 1);
    assert_eq!(usage["balance"], 1_000_000 - 30);

    let (status, _, text) = send(&ctx, "GET", "/user/combos", Some(&login), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("kiro-auto"));
}

#[tokio::test]
async fn health_needs_no_auth() {
    let ctx = setup().await;
    let (status, _, text) = send(&ctx, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("apollo-gateway"));

    let (status, _, _) = send(&ctx, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

fn four_credentials() -> Vec<NewCredential> {
    ["token-a", "token-b", "token-c", "token-d"]
        .into_iter()
        .map(|token| credential(token, "good-refresh"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_cannot_overrun_daily_request_quota() {
    let ctx = setup_with(
        four_credentials(),
        NewAccount {
            name: Some("burst".to_string()),
            balance: 1_000_000,
            quota: AccountQuota {
                daily_requests: 1,
                ..AccountQuota::default()
            },
            ..NewAccount::default()
        },
    )
    .await;

    let (r1, r2, r3, r4) = tokio::join!(
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
    );
    let statuses = [r1.0, r2.0, r3.0, r4.0];
    let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let denied = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(ok, 1, "{statuses:?}");
    assert_eq!(denied, 3, "{statuses:?}");
    assert_eq!(ctx.upstream.calls().len(), 1);

    let records = wait_for_usage_records(&ctx, 1).await;
    assert_eq!(records.len(), 1);
    let account = current_account(&ctx).await;
    assert_eq!(account.in_flight_requests, 0);
    assert_eq!(account.reserved_tokens, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_overdraw_by_at_most_one_request() {
    let ctx = setup_with(
        four_credentials(),
        NewAccount {
            name: Some("tight".to_string()),
            balance: 10,
            ..NewAccount::default()
        },
    )
    .await;

    let (r1, r2, r3, r4) = tokio::join!(
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
        chat(&ctx, chat_body("slow-model")),
    );
    let statuses = [r1.0, r2.0, r3.0, r4.0];
    let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(ok, 1, "{statuses:?}");

    // One 30-token call against a balance of 10.
    let account = current_account(&ctx).await;
    assert_eq!(account.balance, -20);
    assert!(account.flagged_for_review);
    assert_eq!(account.in_flight_requests, 0);
}

#[tokio::test]
async fn failed_forwarding_returns_the_reservation() {
    let ctx = setup_with(vec![credential("bad-token", "bad-refresh")], funded_account()).await;
    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    for _ in 0..100 {
        let account = current_account(&ctx).await;
        if account.in_flight_requests == 0 {
            assert_eq!(account.reserved_tokens, 0);
            assert_eq!(account.balance, 1_000_000);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("reservation never released");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn long_stream_keeps_its_credential_past_the_lease_ttl() {
    let ctx = setup().await;
    set_settings(&ctx, |s| s.lease_ttl_seconds = 1).await;

    let mut body = chat_body("slow-stream-model");
    body["stream"] = json!(true);
    let streaming = send(
        &ctx,
        "POST",
        "/v1/chat/completions",
        Some(&ctx.api_key),
        Some(body),
    );
    let competing = async {
        // Well past the one-second TTL, while the stream is still running.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        chat(&ctx, chat_body("gpt-x")).await
    };
    let ((status, _, text), (second, _)) = tokio::join!(streaming, competing);

    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("w7"));
    assert!(text.contains("[DONE]"));
    assert!(!text.contains("upstream_stream_interrupted"));
    assert_eq!(second, StatusCode::SERVICE_UNAVAILABLE);
    let models: Vec<String> = ctx.upstream.calls().into_iter().map(|c| c.model).collect();
    assert_eq!(models, vec!["slow-stream-model"]);

    let credential = wait_for_lease_release(&ctx).await;
    assert_eq!(credential.use_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_disconnect_mid_stream_still_commits_usage() {
    let ctx = setup().await;
    let mut body = chat_body("slow-stream-model");
    body["stream"] = json!(true);
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(AUTHORIZATION, format!("Bearer {}", ctx.api_key))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let mut body = resp.into_body();
    let first = body.frame().await.expect("first frame").unwrap();
    assert!(first.is_data());
    drop(body);

    let records = wait_for_usage_records(&ctx, 1).await;
    assert_eq!(records[0].prompt_tokens, 7);
    assert_eq!(records[0].completion_tokens, 2);
    assert!(!records[0].estimated);
    assert_eq!(current_account(&ctx).await.balance, 1_000_000 - 9);

    let credential = wait_for_lease_release(&ctx).await;
    assert_eq!(credential.use_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_disconnect_before_buffered_reply_still_commits_usage() {
    let ctx = setup().await;
    tokio::select! {
        _ = chat(&ctx, chat_body("slow-model")) => {
            panic!("slow call finished before the client left")
        }
        _ = async {
            while ctx.upstream.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        } => {}
    }

    let records = wait_for_usage_records(&ctx, 1).await;
    assert_eq!(records[0].prompt_tokens, 10);
    assert_eq!(records[0].completion_tokens, 20);
    let account = current_account(&ctx).await;
    assert_eq!(account.balance, 1_000_000 - 30);
    assert_eq!(account.in_flight_requests, 0);
}

#[tokio::test]
async fn broken_stream_after_content_charges_only_the_delivered_estimate() {
    let ctx = setup().await;
    let mut body = chat_body("cut-stream-model");
    body["stream"] = json!(true);
    let (status, _, text) = send(
        &ctx,
        "POST",
        "/v1/chat/completions",
        Some(&ctx.api_key),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("Hel"));
    assert!(text.contains("upstream_stream_interrupted"));
    assert!(text.contains("[DONE]"));

    let records = wait_for_usage_records(&ctx, 1).await;
    assert!(records[0].estimated);
    assert!(records[0].prompt_tokens > 0);
    assert!(records[0].completion_tokens > 0);
    assert!(records[0].completion_tokens < 10);

    // A broken stream is transient: the credential stays in rotation.
    let credential = wait_for_lease_release(&ctx).await;
    assert_eq!(credential.status, CredentialStatus::Active);
    assert_eq!(credential.use_count, 0);
}

#[tokio::test]
async fn assigned_credential_is_preferred_then_falls_back() {
    let ctx = setup_with(
        vec![
            credential("token-a", "good-refresh"),
            credential("token-b", "good-refresh"),
        ],
        funded_account(),
    )
    .await;
    let credentials = ctx.state.credential_store.list().await.unwrap();
    let assigned = credentials
        .iter()
        .find(|c| c.access_token.as_deref() == Some("token-b"))
        .unwrap()
        .id
        .clone();
    ctx.state
        .account_store
        .set_assigned_credential(&ctx.account.id, Some(&assigned))
        .await
        .unwrap();

    for _ in 0..3 {
        let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(ctx.upstream.calls_with_token("token-b"), 3);
    assert_eq!(ctx.upstream.calls_with_token("token-a"), 0);

    ctx.state
        .credential_store
        .set_status(&assigned, CredentialStatus::Disabled)
        .await
        .unwrap();
    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.upstream.calls_with_token("token-a"), 1);
}

#[tokio::test]
async fn expired_lease_is_taken_over_and_stale_release_is_ignored() {
    let ctx = setup().await;
    set_settings(&ctx, |s| s.lease_ttl_seconds = 1).await;
    let settings = ctx.state.settings_store.get_all().await.unwrap();
    let constraints = AcquireConstraints::default();

    let stale = ctx.state.pool.acquire(&constraints, &settings).await.unwrap();
    assert!(matches!(
        ctx.state.pool.acquire(&constraints, &settings).await,
        Err(PoolError::NoCredentialAvailable)
    ));

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let fresh = ctx.state.pool.acquire(&constraints, &settings).await.unwrap();
    assert_eq!(fresh.credential_id(), stale.credential_id());
    assert_ne!(fresh.lease_id(), stale.lease_id());
    let id = fresh.credential_id().to_string();
    let fresh_lease_id = fresh.lease_id().to_string();

    ctx.state
        .pool
        .release(stale, ReleaseOutcome::Success, &settings)
        .await
        .unwrap();
    let stored = ctx.state.credential_store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.lease_id.as_deref(), Some(fresh_lease_id.as_str()));
    assert_eq!(stored.use_count, 0);

    ctx.state
        .pool
        .release(fresh, ReleaseOutcome::Success, &settings)
        .await
        .unwrap();
    let stored = ctx.state.credential_store.get(&id).await.unwrap().unwrap();
    assert!(stored.lease_id.is_none());
    assert_eq!(stored.use_count, 1);
}

#[tokio::test]
async fn rate_limited_credential_returns_after_cooldown() {
    let ctx = setup().await;
    set_settings(&ctx, |s| s.rate_limit_cooldown_seconds = 1).await;
    let settings = ctx.state.settings_store.get_all().await.unwrap();
    let constraints = AcquireConstraints::default();

    let lease = ctx.state.pool.acquire(&constraints, &settings).await.unwrap();
    let id = lease.credential_id().to_string();
    ctx.state
        .pool
        .release(lease, ReleaseOutcome::RateLimited, &settings)
        .await
        .unwrap();
    let stored = ctx.state.credential_store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, CredentialStatus::Exhausted);
    assert!(matches!(
        ctx.state.pool.acquire(&constraints, &settings).await,
        Err(PoolError::NoCredentialAvailable)
    ));

    // The background sweep runs every second.
    for _ in 0..200 {
        let stored = ctx.state.credential_store.get(&id).await.unwrap().unwrap();
        if stored.status == CredentialStatus::Active {
            assert!(stored.cooldown_until.is_none());
            let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
            assert_eq!(status, StatusCode::OK);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("credential never left cooldown");
}

#[tokio::test]
async fn grants_are_the_only_way_to_raise_a_balance() {
    let ctx = setup().await;
    let granted = ctx
        .state
        .account_store
        .grant_tokens(&ctx.account.id, 500)
        .await
        .unwrap()
        .expect("account exists");
    assert_eq!(granted.balance, 1_000_500);
    assert_eq!(granted.granted_total, 1_000_500);

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current_account(&ctx).await.balance, 1_000_470);

    let clawback = ctx
        .state
        .account_store
        .grant_tokens(&ctx.account.id, -2_000_000)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(clawback.balance, 0);
    assert_eq!(clawback.granted_total, 1_000_500);

    assert!(
        ctx.state
            .account_store
            .grant_tokens("no-such-account", 10)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn upsert_replaces_secrets_and_reactivates_by_client_id() {
    let ctx = setup_with(Vec::new(), funded_account()).await;
    let idc = |access: &str, refresh: &str| NewCredential {
        auth_method: Some("idc".to_string()),
        client_id: Some("client-1".to_string()),
        client_secret: Some("secret".to_string()),
        ..credential(access, refresh)
    };

    let first = ctx
        .state
        .credential_store
        .upsert(idc("old-token", "old-refresh"))
        .await
        .unwrap();
    assert!(first.client_id_hash.is_some());
    ctx.state
        .credential_store
        .set_status(&first.id, CredentialStatus::Disabled)
        .await
        .unwrap();

    let second = ctx
        .state
        .credential_store
        .upsert(idc("new-token", "good-refresh"))
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, CredentialStatus::Active);
    assert_eq!(second.refresh_token, "good-refresh");
    assert_eq!(ctx.state.credential_store.list().await.unwrap().len(), 1);

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.upstream.calls_with_token("new-token"), 1);
}

#[tokio::test]
async fn builtin_mappings_cannot_be_removed() {
    let ctx = setup().await;
    assert_eq!(
        ctx.state.mapping_store.remove("kiro-auto").await,
        Err(MappingError::Builtin("kiro-auto".to_string()))
    );

    ctx.state
        .mapping_store
        .set("team-model", MappingKind::Alias, vec!["upstream-a".to_string()])
        .await
        .unwrap();
    let (status, _) = chat(&ctx, chat_body("team-model")).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(ctx.state.mapping_store.remove("team-model").await, Ok(true));
    assert_eq!(ctx.state.mapping_store.remove("team-model").await, Ok(false));
    let (status, _) = chat(&ctx, chat_body("team-model")).await;
    assert_eq!(status, StatusCode::OK);

    let models: Vec<String> = ctx.upstream.calls().into_iter().map(|c| c.model).collect();
    assert_eq!(models, vec!["upstream-a", "team-model"]);
}

#[tokio::test]
async fn reset_usage_clears_history_and_request_quota() {
    let ctx = setup().await;
    ctx.state
        .account_store
        .set_quota(
            &ctx.account.id,
            AccountQuota {
                daily_requests: 1,
                ..AccountQuota::default()
            },
        )
        .await
        .unwrap();
    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let deleted = ctx.state.quota.reset_usage(&ctx.account.id).await.unwrap();
    assert_eq!(deleted, 1);
    assert!(
        ctx.state
            .usage_store
            .list_for_account(&ctx.account.id)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(current_account(&ctx).await.request_count, 0);

    let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn operator_views_summarize_usage_and_mask_secrets() {
    let ctx = setup_with(
        vec![credential(
            "access-token-0123456789abcdef",
            "refresh-token-0123456789abcdef",
        )],
        funded_account(),
    )
    .await;
    for _ in 0..2 {
        let (status, _) = chat(&ctx, chat_body("gpt-x")).await;
        assert_eq!(status, StatusCode::OK);
    }
    record_usage(&ctx, 5, 5).await;

    let credential_id = ctx.state.credential_store.list().await.unwrap()[0].id.clone();
    let by_credential = ctx
        .state
        .usage_store
        .credential_summary(&credential_id)
        .await
        .unwrap();
    assert_eq!(by_credential.total_requests, 2);
    assert_eq!(by_credential.total_tokens, 60);

    let global = ctx.state.usage_store.global_summary().await.unwrap();
    assert_eq!(global.total_requests, 3);
    assert_eq!(global.total_tokens, 70);
    assert!(global.by_model.contains_key("gpt-x"));

    let masked = ctx.state.credential_store.list_masked().await.unwrap();
    assert_eq!(masked.len(), 1);
    assert_eq!(masked[0].refresh_token, "refresh-token-01...");
    assert_eq!(masked[0].access_token.as_deref(), Some("access-token-012..."));
    assert!(!masked[0].leased);
}

