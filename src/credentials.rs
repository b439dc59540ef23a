use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Disabled,
    Exhausted,
}

impl CredentialStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CredentialStatus::Active),
            "disabled" => Some(CredentialStatus::Disabled),
            "exhausted" => Some(CredentialStatus::Exhausted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Disabled => "disabled",
            CredentialStatus::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Social,
    Idc,
}

impl AuthMethod {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "idc" | "builder-id" | "iam" => AuthMethod::Idc,
            _ => AuthMethod::Social,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Social => "social",
            AuthMethod::Idc => "idc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub region: String,
    pub auth_method: AuthMethod,
    pub provider: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_id_hash: Option<String>,
    pub profile_arn: Option<String>,
    pub status: CredentialStatus,
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: i64,
    pub added_at: DateTime<Utc>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub lease_id: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Credential {
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.trim().is_empty()
    }

    /// True when there is no usable access token, or it expires within `skew`.
    pub fn access_token_stale(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        let missing = self
            .access_token
            .as_deref()
            .is_none_or(|t| t.trim().is_empty());
        if missing {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => expires_at <= now + skew,
            None => false,
        }
    }
}

/// Display-safe view of a credential.
#[derive(Debug, Clone, Serialize)]
pub struct MaskedCredential {
    pub id: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub region: String,
    pub auth_method: AuthMethod,
    pub provider: Option<String>,
    pub status: CredentialStatus,
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: i64,
    pub added_at: DateTime<Utc>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub leased: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCredential {
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub auth_method: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_id_hash: Option<String>,
    #[serde(default)]
    pub profile_arn: Option<String>,
}

/// Tokens produced by a refresh exchange.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

/// Fixed-width UTC timestamp so that TEXT columns compare chronologically.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, String> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| e.to_string())
}

pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 16 {
        return format!("{secret}...");
    }
    let prefix: String = secret.chars().take(16).collect();
    format!("{prefix}...")
}

pub fn hash_client_id(client_id: &str) -> String {
    hex::encode(Sha256::digest(client_id.as_bytes()))
}

/// Dedup key of an incoming credential: the supplied hash, else one derived
/// from its client id.
fn dedup_hash(input: &NewCredential) -> Option<String> {
    input
        .client_id_hash
        .clone()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            input
                .client_id
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(hash_client_id)
        })
}

const CREDENTIAL_COLUMNS: &str = "id, refresh_token, access_token, expires_at, region, auth_method, provider, client_id, client_secret, client_id_hash, profile_arn, status, last_used, use_count, added_at, cooldown_until, lease_id, lease_until, last_error";

/// A credential can be leased when it is active (or exhausted with an elapsed
/// cooldown), holds no live lease, and either has a refresh token or an
/// access token that has not expired yet. Bind order: now, now, now.
const SELECTABLE_PREDICATE: &str = "(status = 'active' OR (status = 'exhausted' AND cooldown_until IS NOT NULL AND cooldown_until <= ?))
     AND (lease_id IS NULL OR lease_until IS NULL OR lease_until <= ?)
     AND (refresh_token <> '' OR expires_at IS NULL OR expires_at > ?)";

#[derive(Clone)]
pub struct CredentialStore {
    pool: Pool<Sqlite>,
}

impl CredentialStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                refresh_token TEXT NOT NULL DEFAULT '',
                access_token TEXT,
                expires_at TEXT,
                region TEXT NOT NULL DEFAULT 'us-east-1',
                auth_method TEXT NOT NULL DEFAULT 'social',
                provider TEXT,
                client_id TEXT,
                client_secret TEXT,
                client_id_hash TEXT UNIQUE,
                profile_arn TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                last_used TEXT,
                use_count INTEGER NOT NULL DEFAULT 0,
                added_at TEXT NOT NULL,
                cooldown_until TEXT,
                lease_id TEXT,
                lease_until TEXT,
                last_error TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_credentials_status_last_used ON credentials(status, last_used)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn insert(&self, input: NewCredential) -> Result<Credential, String> {
        let id = new_credential_id();
        let now = Utc::now();
        let auth_method = resolve_auth_method(&input);
        let region = input
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        sqlx::query(
            r#"INSERT INTO credentials (id, refresh_token, access_token, expires_at, region, auth_method, provider, client_id, client_secret, client_id_hash, profile_arn, status, use_count, added_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', 0, ?)"#,
        )
        .bind(&id)
        .bind(&input.refresh_token)
        .bind(&input.access_token)
        .bind(input.expires_at.map(fmt_ts))
        .bind(&region)
        .bind(auth_method.as_str())
        .bind(&input.provider)
        .bind(&input.client_id)
        .bind(&input.client_secret)
        .bind(dedup_hash(&input))
        .bind(&input.profile_arn)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get(&id)
            .await?
            .ok_or_else(|| "credential vanished after insert".to_string())
    }

    /// Inserts a credential, or replaces the secrets of the one that shares
    /// its client id hash and puts it back into rotation.
    pub async fn upsert(&self, input: NewCredential) -> Result<Credential, String> {
        let Some(hash) = dedup_hash(&input) else {
            return self.insert(input).await;
        };
        let existing = sqlx::query("SELECT id FROM credentials WHERE client_id_hash = ?")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let Some(row) = existing else {
            return self.insert(input).await;
        };
        let id: String = row.try_get("id").map_err(|e| e.to_string())?;
        let auth_method = resolve_auth_method(&input);
        let region = input
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        sqlx::query(
            r#"UPDATE credentials
               SET refresh_token = ?, access_token = ?, expires_at = ?, region = ?, auth_method = ?,
                   provider = COALESCE(?, provider), client_id = ?, client_secret = ?,
                   profile_arn = COALESCE(?, profile_arn), status = 'active', cooldown_until = NULL,
                   last_error = NULL
               WHERE id = ?"#,
        )
        .bind(&input.refresh_token)
        .bind(&input.access_token)
        .bind(input.expires_at.map(fmt_ts))
        .bind(&region)
        .bind(auth_method.as_str())
        .bind(&input.provider)
        .bind(&input.client_id)
        .bind(&input.client_secret)
        .bind(&input.profile_arn)
        .bind(&id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        tracing::info!(credential_id = %id, "credential secrets replaced by upsert");
        self.get(&id)
            .await?
            .ok_or_else(|| "credential vanished after upsert".to_string())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Credential>, String> {
        let row = sqlx::query(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        row.map(|r| self.row_to_credential(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Credential>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials ORDER BY added_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter().map(|row| self.row_to_credential(row)).collect()
    }

    pub async fn list_masked(&self) -> Result<Vec<MaskedCredential>, String> {
        let now = Utc::now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|c| MaskedCredential {
                refresh_token: mask_secret(&c.refresh_token),
                access_token: c.access_token.as_deref().map(mask_secret),
                leased: c.lease_id.is_some() && c.lease_until.is_some_and(|until| until > now),
                id: c.id,
                expires_at: c.expires_at,
                region: c.region,
                auth_method: c.auth_method,
                provider: c.provider,
                status: c.status,
                last_used: c.last_used,
                use_count: c.use_count,
                added_at: c.added_at,
                cooldown_until: c.cooldown_until,
                last_error: c.last_error,
            })
            .collect())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Operator status override; clears any cooldown.
    pub async fn set_status(&self, id: &str, status: CredentialStatus) -> Result<bool, String> {
        let result = sqlx::query(
            "UPDATE credentials SET status = ?, cooldown_until = NULL WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Leasable credentials as `(id, last_used)`, least recently used first
    /// (never-used credentials sort first).
    pub async fn list_selectable(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Option<String>)>, String> {
        let now = fmt_ts(now);
        let rows = sqlx::query(&format!(
            "SELECT id, last_used FROM credentials WHERE {SELECTABLE_PREDICATE} ORDER BY last_used ASC, added_at ASC, id ASC"
        ))
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("id").map_err(|e| e.to_string())?,
                    row.try_get::<Option<String>, _>("last_used")
                        .map_err(|e| e.to_string())?,
                ))
            })
            .collect()
    }

    /// Attempts to take an exclusive lease. The whole check-and-claim is one
    /// conditional UPDATE, so of any number of concurrent callers at most one
    /// observes `true` for a given credential.
    pub async fn try_lease(
        &self,
        id: &str,
        lease_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, String> {
        let now = fmt_ts(now);
        let result = sqlx::query(&format!(
            r#"UPDATE credentials
               SET lease_id = ?, lease_until = ?, status = 'active', cooldown_until = NULL
               WHERE id = ? AND {SELECTABLE_PREDICATE}"#
        ))
        .bind(lease_id)
        .bind(fmt_ts(lease_until))
        .bind(id)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    /// Pushes `lease_until` forward for the current holder. False means the
    /// lease was released or taken over.
    pub async fn extend_lease(
        &self,
        id: &str,
        lease_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, String> {
        let result =
            sqlx::query("UPDATE credentials SET lease_until = ? WHERE id = ? AND lease_id = ?")
                .bind(fmt_ts(lease_until))
                .bind(id)
                .bind(lease_id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    /// Persists refreshed tokens. Only the current lease holder may write.
    pub async fn update_tokens_under_lease(
        &self,
        id: &str,
        lease_id: &str,
        tokens: &RefreshedTokens,
    ) -> Result<bool, String> {
        let result = sqlx::query(
            r#"UPDATE credentials
               SET access_token = ?, refresh_token = COALESCE(?, refresh_token), expires_at = ?,
                   profile_arn = COALESCE(?, profile_arn)
               WHERE id = ? AND lease_id = ?"#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at.map(fmt_ts))
        .bind(&tokens.profile_arn)
        .bind(id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_success(
        &self,
        id: &str,
        lease_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        let result = sqlx::query(
            r#"UPDATE credentials
               SET lease_id = NULL, lease_until = NULL, last_used = ?, use_count = use_count + 1,
                   last_error = NULL
               WHERE id = ? AND lease_id = ?"#,
        )
        .bind(fmt_ts(now))
        .bind(id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_disabled(
        &self,
        id: &str,
        lease_id: &str,
        reason: &str,
    ) -> Result<bool, String> {
        let result = sqlx::query(
            r#"UPDATE credentials
               SET lease_id = NULL, lease_until = NULL, status = 'disabled', cooldown_until = NULL,
                   last_error = ?
               WHERE id = ? AND lease_id = ?"#,
        )
        .bind(reason)
        .bind(id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_transient(
        &self,
        id: &str,
        lease_id: &str,
        reason: Option<&str>,
    ) -> Result<bool, String> {
        let result = sqlx::query(
            r#"UPDATE credentials
               SET lease_id = NULL, lease_until = NULL, last_error = COALESCE(?, last_error)
               WHERE id = ? AND lease_id = ?"#,
        )
        .bind(reason)
        .bind(id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_exhausted(
        &self,
        id: &str,
        lease_id: &str,
        cooldown_until: DateTime<Utc>,
    ) -> Result<bool, String> {
        let result = sqlx::query(
            r#"UPDATE credentials
               SET lease_id = NULL, lease_until = NULL, status = 'exhausted', cooldown_until = ?,
                   last_error = 'rate limited'
               WHERE id = ? AND lease_id = ?"#,
        )
        .bind(fmt_ts(cooldown_until))
        .bind(id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    /// Moves exhausted credentials whose cooldown elapsed back to active.
    pub async fn reactivate_cooled_down(&self, now: DateTime<Utc>) -> Result<u64, String> {
        let result = sqlx::query(
            r#"UPDATE credentials SET status = 'active', cooldown_until = NULL
               WHERE status = 'exhausted' AND cooldown_until IS NOT NULL AND cooldown_until <= ?"#,
        )
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected())
    }

    fn row_to_credential(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Credential, String> {
        let status_raw: String = row.try_get("status").map_err(|e| e.to_string())?;
        let status = CredentialStatus::from_str(&status_raw)
            .ok_or_else(|| format!("invalid credential status: {status_raw}"))?;
        let auth_method: String = row.try_get("auth_method").map_err(|e| e.to_string())?;
        let added_at = parse_ts(row.try_get("added_at").map_err(|e| e.to_string())?)?
            .ok_or_else(|| "credential missing added_at".to_string())?;

        Ok(Credential {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            refresh_token: row.try_get("refresh_token").map_err(|e| e.to_string())?,
            access_token: row.try_get("access_token").map_err(|e| e.to_string())?,
            expires_at: parse_ts(row.try_get("expires_at").map_err(|e| e.to_string())?)?,
            region: row.try_get("region").map_err(|e| e.to_string())?,
            auth_method: AuthMethod::from_str(&auth_method),
            provider: row.try_get("provider").map_err(|e| e.to_string())?,
            client_id: row.try_get("client_id").map_err(|e| e.to_string())?,
            client_secret: row.try_get("client_secret").map_err(|e| e.to_string())?,
            client_id_hash: row.try_get("client_id_hash").map_err(|e| e.to_string())?,
            profile_arn: row.try_get("profile_arn").map_err(|e| e.to_string())?,
            status,
            last_used: parse_ts(row.try_get("last_used").map_err(|e| e.to_string())?)?,
            use_count: row.try_get("use_count").map_err(|e| e.to_string())?,
            added_at,
            cooldown_until: parse_ts(row.try_get("cooldown_until").map_err(|e| e.to_string())?)?,
            lease_id: row.try_get("lease_id").map_err(|e| e.to_string())?,
            lease_until: parse_ts(row.try_get("lease_until").map_err(|e| e.to_string())?)?,
            last_error: row.try_get("last_error").map_err(|e| e.to_string())?,
        })
    }
}

fn resolve_auth_method(input: &NewCredential) -> AuthMethod {
    match input.auth_method.as_deref() {
        Some(raw) => AuthMethod::from_str(raw),
        None if input.client_id.is_some() && input.client_secret.is_some() => AuthMethod::Idc,
        None => AuthMethod::Social,
    }
}

fn new_credential_id() -> String {
    let mut bytes = [0u8; 4];
    rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut bytes);
    hex::encode(bytes)
}
