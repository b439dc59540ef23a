use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

/// Operational policy of the gateway, persisted as key/value rows so that
/// every serving instance reads the same values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub max_credential_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub lease_ttl_seconds: u64,
    pub rate_limit_cooldown_seconds: u64,
    pub acquire_wait_ms: u64,
    pub request_timeout_ms: u64,
    pub refresh_skew_seconds: u64,
    pub strict_balance: bool,
    pub estimate_max_completion_tokens: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_credential_attempts: 3,
            retry_backoff_base_ms: 200,
            retry_backoff_max_ms: 2000,
            lease_ttl_seconds: 600,
            rate_limit_cooldown_seconds: 60,
            acquire_wait_ms: 0,
            request_timeout_ms: 120_000,
            refresh_skew_seconds: 300,
            strict_balance: false,
            estimate_max_completion_tokens: 0,
            updated_at: Utc::now(),
        }
    }
}

impl GatewaySettings {
    fn as_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "max_credential_attempts",
                self.max_credential_attempts.to_string(),
            ),
            ("retry_backoff_base_ms", self.retry_backoff_base_ms.to_string()),
            ("retry_backoff_max_ms", self.retry_backoff_max_ms.to_string()),
            ("lease_ttl_seconds", self.lease_ttl_seconds.to_string()),
            (
                "rate_limit_cooldown_seconds",
                self.rate_limit_cooldown_seconds.to_string(),
            ),
            ("acquire_wait_ms", self.acquire_wait_ms.to_string()),
            ("request_timeout_ms", self.request_timeout_ms.to_string()),
            ("refresh_skew_seconds", self.refresh_skew_seconds.to_string()),
            ("strict_balance", self.strict_balance.to_string()),
            (
                "estimate_max_completion_tokens",
                self.estimate_max_completion_tokens.to_string(),
            ),
        ]
    }

    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// capped at the configured maximum.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_backoff_max_ms);
        std::time::Duration::from_millis(ms)
    }

    pub fn lease_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lease_ttl_seconds)
    }

    /// Enforces the invariants the pipeline relies on. A single upstream
    /// call may take up to two timeouts (refresh plus request) under one
    /// lease, so the timeout is held to half the lease TTL.
    fn normalize(&mut self) {
        self.max_credential_attempts = self.max_credential_attempts.max(1);
        self.lease_ttl_seconds = self.lease_ttl_seconds.max(1);
        self.request_timeout_ms = self
            .request_timeout_ms
            .min(self.lease_ttl_seconds.saturating_mul(1000) / 2)
            .max(1);
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    pool: Pool<Sqlite>,
}

impl SettingsStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS system_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let store = Self { pool };
        store.ensure_defaults().await?;
        Ok(store)
    }

    async fn ensure_defaults(&self) -> Result<(), String> {
        for (key, value) in GatewaySettings::default().as_pairs() {
            self.set_if_not_exists(key, &value).await?;
        }
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(row.map(|r| r.try_get("value").unwrap_or_default()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<GatewaySettings, String> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM system_settings")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let mut settings = GatewaySettings::default();
        let mut latest_update = settings.updated_at;

        for row in rows {
            let key: String = row.try_get("key").map_err(|e| e.to_string())?;
            let value: String = row.try_get("value").map_err(|e| e.to_string())?;
            let updated_at_str: String = row.try_get("updated_at").map_err(|e| e.to_string())?;

            if let Ok(updated_at) = DateTime::parse_from_rfc3339(&updated_at_str) {
                let updated_at = updated_at.with_timezone(&Utc);
                if updated_at > latest_update {
                    latest_update = updated_at;
                }
            }

            let value = value.trim();
            match key.as_str() {
                "max_credential_attempts" => {
                    settings.max_credential_attempts = value.parse().unwrap_or(3);
                }
                "retry_backoff_base_ms" => {
                    settings.retry_backoff_base_ms = value.parse().unwrap_or(200);
                }
                "retry_backoff_max_ms" => {
                    settings.retry_backoff_max_ms = value.parse().unwrap_or(2000);
                }
                "lease_ttl_seconds" => {
                    settings.lease_ttl_seconds = value.parse().unwrap_or(600);
                }
                "rate_limit_cooldown_seconds" => {
                    settings.rate_limit_cooldown_seconds = value.parse().unwrap_or(60);
                }
                "acquire_wait_ms" => {
                    settings.acquire_wait_ms = value.parse().unwrap_or(0);
                }
                "request_timeout_ms" => {
                    settings.request_timeout_ms = value.parse().unwrap_or(120_000);
                }
                "refresh_skew_seconds" => {
                    settings.refresh_skew_seconds = value.parse().unwrap_or(300);
                }
                "strict_balance" => {
                    settings.strict_balance = value.parse().unwrap_or(false);
                }
                "estimate_max_completion_tokens" => {
                    settings.estimate_max_completion_tokens = value.parse().unwrap_or(0);
                }
                _ => {}
            }
        }

        settings.normalize();
        settings.updated_at = latest_update;
        Ok(settings)
    }

    pub async fn update_all(&self, settings: &GatewaySettings) -> Result<(), String> {
        for (key, value) in settings.as_pairs() {
            self.set(key, &value).await?;
        }
        Ok(())
    }
}
