use crate::accounts::AccountStore;
use crate::credentials::CredentialStore;
use crate::error::{AppError, AppResult};
use crate::forwarder::Forwarder;
use crate::gateway::Gateway;
use crate::mappings::MappingStore;
use crate::pool::CredentialPool;
use crate::quota::QuotaEnforcer;
use crate::refresh::{DEFAULT_IDC_REFRESH_URL, DEFAULT_SOCIAL_REFRESH_URL, RefreshEndpoints};
use crate::settings::SettingsStore;
use crate::upstream::DEFAULT_UPSTREAM_BASE_URL;
use crate::usage::UsageStore;
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tokio::time::sleep;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub settings_store: SettingsStore,
    pub credential_store: CredentialStore,
    pub account_store: AccountStore,
    pub usage_store: UsageStore,
    pub mapping_store: MappingStore,
    pub pool: CredentialPool,
    pub quota: QuotaEnforcer,
    pub gateway: Gateway,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

const COOLDOWN_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    /// Upstream base URL; `{region}` is replaced by the credential's region.
    pub upstream_base_url: String,
    pub social_refresh_url: String,
    pub idc_refresh_url: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("APOLLO_LISTEN", "0.0.0.0:8000"),
            metrics_path: env_or("APOLLO_METRICS_PATH", "/metrics"),
            database_dsn: resolve_database_dsn(),
            upstream_base_url: env_or("APOLLO_UPSTREAM_BASE_URL", DEFAULT_UPSTREAM_BASE_URL),
            social_refresh_url: env_or("APOLLO_SOCIAL_REFRESH_URL", DEFAULT_SOCIAL_REFRESH_URL),
            idc_refresh_url: env_or("APOLLO_IDC_REFRESH_URL", DEFAULT_IDC_REFRESH_URL),
        }
    }

    pub fn refresh_endpoints(&self) -> RefreshEndpoints {
        RefreshEndpoints {
            social_url: self.social_refresh_url.clone(),
            idc_url: self.idc_refresh_url.clone(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn init_error(code: &'static str) -> impl FnOnce(String) -> AppError {
    move |err| AppError::new(axum::http::StatusCode::BAD_REQUEST, code, err)
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("apollo-gateway/0.1")
        .build()
        .map_err(|err| init_error("http_client_init_failed")(err.to_string()))?;

    ensure_sqlite_file(&runtime.database_dsn).map_err(init_error("database_init_failed"))?;

    // Every in-memory connection is its own database.
    let max_connections = if is_memory_dsn(&runtime.database_dsn) {
        1
    } else {
        5
    };
    let db = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| init_error("database_dsn_parse_failed")(err.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| init_error("database_init_failed")(err.to_string()))?;

    let settings_store = SettingsStore::new(db.clone())
        .await
        .map_err(init_error("settings_store_init_failed"))?;
    let credential_store = CredentialStore::new(db.clone())
        .await
        .map_err(init_error("credential_store_init_failed"))?;
    let account_store = AccountStore::new(db.clone())
        .await
        .map_err(init_error("account_store_init_failed"))?;
    let usage_store = UsageStore::new(db.clone())
        .await
        .map_err(init_error("usage_store_init_failed"))?;
    let mapping_store = MappingStore::new(db.clone())
        .await
        .map_err(init_error("mapping_store_init_failed"))?;

    // Holds left by a previous process can never be settled.
    let stale = account_store
        .clear_reservations()
        .await
        .map_err(init_error("account_store_init_failed"))?;
    if stale > 0 {
        tracing::warn!(accounts = stale, "cleared quota reservations left by a previous run");
    }

    let metrics = init_metrics()?;

    let pool = CredentialPool::new(credential_store.clone());
    let quota = QuotaEnforcer::new(db, account_store.clone(), usage_store.clone());
    let forwarder = Forwarder::new(
        http.clone(),
        runtime.upstream_base_url.clone(),
        runtime.refresh_endpoints(),
    );
    let gateway = Gateway {
        settings: settings_store.clone(),
        mappings: mapping_store.clone(),
        pool: pool.clone(),
        quota: quota.clone(),
        forwarder,
    };

    tokio::task::spawn_blocking(crate::tokens::preload_tokenizer);

    let sweep_pool = pool.clone();
    tokio::spawn(async move {
        loop {
            sleep(COOLDOWN_SWEEP_INTERVAL).await;
            if let Err(err) = sweep_pool.reactivate_cooled_down().await {
                tracing::warn!("cooldown sweep failed: {err}");
            }
        }
    });

    tracing::info!(
        database = %runtime.database_dsn,
        upstream = %runtime.upstream_base_url,
        "gateway state loaded"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        settings_store,
        credential_store,
        account_store,
        usage_store,
        mapping_store,
        pool,
        quota,
        gateway,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn resolve_database_dsn() -> String {
    std::env::var("APOLLO_DATABASE_DSN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| "sqlite://./data/apollo.db".to_string())
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if is_memory_dsn(dsn) {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let openai_router = build_openai_router();
    Router::<AppState>::new()
        .merge(openai_router.clone())
        .nest("/api", openai_router)
        .merge(build_user_router())
        .route("/", get(crate::handlers::health))
        .route("/health", get(crate::handlers::health))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_openai_router() -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
}

fn build_user_router() -> Router<AppState> {
    Router::new()
        .route("/user/me", get(crate::user_handlers::get_me))
        .route(
            "/user/apikeys",
            get(crate::user_handlers::list_apikeys)
                .post(crate::user_handlers::create_apikey)
                .delete(crate::user_handlers::revoke_apikey),
        )
        .route("/user/usage", get(crate::user_handlers::get_usage))
        .route("/user/combos", get(crate::user_handlers::list_combos))
}
