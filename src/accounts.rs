use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};

use crate::credentials::{fmt_ts, parse_ts};

pub const API_KEY_PREFIX: &str = "ap-";
pub const LOGIN_TOKEN_PREFIX: &str = "apollo-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
}

impl AccountStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "disabled" => Some(AccountStatus::Disabled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
        }
    }
}

/// Per-period limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountQuota {
    #[serde(default)]
    pub daily_tokens: i64,
    #[serde(default)]
    pub monthly_tokens: i64,
    #[serde(default)]
    pub daily_requests: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub login_token: String,
    pub status: AccountStatus,
    pub assigned_credential_id: Option<String>,
    pub balance: i64,
    pub granted_total: i64,
    pub quota: AccountQuota,
    pub request_count: i64,
    pub flagged_for_review: bool,
    pub last_overdraft: i64,
    /// Admitted requests that have not committed or released yet.
    pub in_flight_requests: i64,
    /// Estimated cost held by those requests.
    pub reserved_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAccount {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub balance: i64,
    #[serde(default)]
    pub quota: AccountQuota,
    #[serde(default)]
    pub assigned_credential_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub id: String,
    pub account_id: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Balance after an atomic debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebitOutcome {
    pub balance_after: i64,
    /// Tokens charged beyond the balance that existed before the debit.
    pub overdraft: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrantOutcome {
    pub account_id: String,
    pub balance: i64,
    pub granted_total: i64,
}

const ACCOUNT_COLUMNS: &str = "id, name, login_token, status, assigned_credential_id, balance, granted_total, quota_daily_tokens, quota_monthly_tokens, quota_daily_requests, request_count, flagged_for_review, last_overdraft, in_flight_requests, reserved_tokens, created_at, last_used";

const RELEASE_RESERVATION_SQL: &str = r#"UPDATE accounts
    SET in_flight_requests = MAX(in_flight_requests - 1, 0),
        reserved_tokens = MAX(reserved_tokens - ?, 0)
    WHERE id = ?"#;

#[derive(Clone)]
pub struct AccountStore {
    pool: Pool<Sqlite>,
}

impl AccountStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                login_token TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'active',
                assigned_credential_id TEXT,
                balance INTEGER NOT NULL DEFAULT 0,
                granted_total INTEGER NOT NULL DEFAULT 0,
                quota_daily_tokens INTEGER NOT NULL DEFAULT 0,
                quota_monthly_tokens INTEGER NOT NULL DEFAULT 0,
                quota_daily_requests INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                flagged_for_review INTEGER NOT NULL DEFAULT 0,
                last_overdraft INTEGER NOT NULL DEFAULT 0,
                in_flight_requests INTEGER NOT NULL DEFAULT 0,
                reserved_tokens INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_used TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let has_reservation_columns: bool = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM pragma_table_info('accounts') WHERE name = 'in_flight_requests'",
        )
        .fetch_one(&pool)
        .await
        .map(|c| c > 0)
        .unwrap_or(false);
        if !has_reservation_columns {
            sqlx::query(
                "ALTER TABLE accounts ADD COLUMN in_flight_requests INTEGER NOT NULL DEFAULT 0",
            )
            .execute(&pool)
            .await
            .ok();
            sqlx::query("ALTER TABLE accounts ADD COLUMN reserved_tokens INTEGER NOT NULL DEFAULT 0")
                .execute(&pool)
                .await
                .ok();
        }

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                last_used_at TEXT,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_account ON api_keys(account_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub fn hash_key(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    pub async fn create_account(&self, input: NewAccount) -> Result<Account, String> {
        let id = random_hex(8);
        let name = input
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("User-{}", random_hex(4)));
        let login_token = format!("{LOGIN_TOKEN_PREFIX}{}", random_hex(16));
        let now = Utc::now();
        let balance = input.balance.max(0);

        sqlx::query(
            r#"INSERT INTO accounts (id, name, login_token, status, assigned_credential_id, balance, granted_total, quota_daily_tokens, quota_monthly_tokens, quota_daily_requests, created_at)
               VALUES (?, ?, ?, 'active', ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&name)
        .bind(&login_token)
        .bind(&input.assigned_credential_id)
        .bind(balance)
        .bind(balance)
        .bind(input.quota.daily_tokens.max(0))
        .bind(input.quota.monthly_tokens.max(0))
        .bind(input.quota.daily_requests.max(0))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        tracing::info!(account_id = %id, name = %name, "account created");
        self.get(&id)
            .await?
            .ok_or_else(|| "account vanished after insert".to_string())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Account>, String> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|r| self.row_to_account(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Account>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(|row| self.row_to_account(row)).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool, String> {
        sqlx::query("DELETE FROM api_keys WHERE account_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Active account owning the given login token.
    pub async fn find_by_login_token(&self, token: &str) -> Result<Option<Account>, String> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE login_token = ? AND status = 'active'"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|r| self.row_to_account(&r)).transpose()
    }

    pub async fn set_status(&self, id: &str, status: AccountStatus) -> Result<bool, String> {
        let result = sqlx::query("UPDATE accounts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        if result.rows_affected() > 0 {
            tracing::info!(account_id = %id, status = status.as_str(), "account status changed");
        }
        Ok(result.rows_affected() > 0)
    }

    /// Sets or clears (None) the sticky credential of an account.
    pub async fn set_assigned_credential(
        &self,
        id: &str,
        credential_id: Option<&str>,
    ) -> Result<bool, String> {
        let result = sqlx::query("UPDATE accounts SET assigned_credential_id = ? WHERE id = ?")
            .bind(credential_id.filter(|c| !c.is_empty()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_quota(&self, id: &str, quota: AccountQuota) -> Result<bool, String> {
        let result = sqlx::query(
            "UPDATE accounts SET quota_daily_tokens = ?, quota_monthly_tokens = ?, quota_daily_requests = ? WHERE id = ?",
        )
        .bind(quota.daily_tokens.max(0))
        .bind(quota.monthly_tokens.max(0))
        .bind(quota.daily_requests.max(0))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Explicit grant: the only path that raises a balance. A negative amount
    /// claws back balance (never below zero) without touching the grant total.
    pub async fn grant_tokens(&self, id: &str, amount: i64) -> Result<Option<GrantOutcome>, String> {
        let granted_delta = amount.max(0);
        let row = sqlx::query(
            r#"UPDATE accounts
               SET balance = CASE WHEN ? < 0 THEN MAX(0, balance + ?) ELSE balance + ? END,
                   granted_total = granted_total + ?
               WHERE id = ?
               RETURNING balance, granted_total"#,
        )
        .bind(amount)
        .bind(amount)
        .bind(amount)
        .bind(granted_delta)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let outcome = GrantOutcome {
            account_id: id.to_string(),
            balance: row.try_get("balance").map_err(|e| e.to_string())?,
            granted_total: row.try_get("granted_total").map_err(|e| e.to_string())?,
        };
        tracing::info!(
            account_id = %id,
            amount,
            balance = outcome.balance,
            "tokens granted"
        );
        Ok(Some(outcome))
    }

    /// Debits `amount` tokens inside the caller's transaction as one
    /// conditional UPDATE. In strict mode the balance clamps at zero; otherwise
    /// it may go negative. Either way an overdrawing debit flags the account.
    pub async fn debit_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        id: &str,
        amount: i64,
        strict: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<DebitOutcome>, String> {
        let amount = amount.max(0);
        let row = sqlx::query(
            r#"UPDATE accounts
               SET balance = CASE WHEN ? = 1 AND balance < ? THEN 0 ELSE balance - ? END,
                   last_overdraft = CASE WHEN balance < ? THEN ? - MAX(balance, 0) ELSE 0 END,
                   flagged_for_review = CASE WHEN balance < ? THEN 1 ELSE flagged_for_review END,
                   request_count = request_count + 1,
                   last_used = ?
               WHERE id = ?
               RETURNING balance, last_overdraft"#,
        )
        .bind(if strict { 1 } else { 0 })
        .bind(amount)
        .bind(amount)
        .bind(amount)
        .bind(amount)
        .bind(amount)
        .bind(fmt_ts(now))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DebitOutcome {
            balance_after: row.try_get("balance").map_err(|e| e.to_string())?,
            overdraft: row.try_get("last_overdraft").map_err(|e| e.to_string())?,
        }))
    }

    /// Returns one admitted request's reservation. Counters never drop
    /// below zero.
    pub async fn release_reservation(&self, id: &str, tokens: i64) -> Result<bool, String> {
        let result = sqlx::query(RELEASE_RESERVATION_SQL)
            .bind(tokens.max(0))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn release_reservation_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        id: &str,
        tokens: i64,
    ) -> Result<bool, String> {
        let result = sqlx::query(RELEASE_RESERVATION_SQL)
            .bind(tokens.max(0))
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops every outstanding reservation. Only safe while no request is in
    /// flight, i.e. at startup.
    pub async fn clear_reservations(&self) -> Result<u64, String> {
        let result = sqlx::query(
            "UPDATE accounts SET in_flight_requests = 0, reserved_tokens = 0 WHERE in_flight_requests <> 0 OR reserved_tokens <> 0",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected())
    }

    pub async fn reset_request_count(&self, id: &str) -> Result<bool, String> {
        let result = sqlx::query("UPDATE accounts SET request_count = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn issue_api_key(&self, account_id: &str) -> Result<(ApiKeyInfo, String), String> {
        if self.get(account_id).await?.is_none() {
            return Err("account not found".to_string());
        }
        let key = format!("{API_KEY_PREFIX}{}", random_hex(16));
        let key_prefix: String = key.chars().take(API_KEY_PREFIX.len() + 8).collect();
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"INSERT INTO api_keys (id, account_id, key_prefix, key_hash, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(account_id)
        .bind(&key_prefix)
        .bind(Self::hash_key(&key))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        tracing::info!(account_id = %account_id, key_prefix = %key_prefix, "api key issued");
        Ok((
            ApiKeyInfo {
                id,
                account_id: account_id.to_string(),
                key_prefix,
                created_at: now,
                last_used_at: None,
            },
            key,
        ))
    }

    pub async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeyInfo>, String> {
        let rows = sqlx::query(
            "SELECT id, account_id, key_prefix, created_at, last_used_at FROM api_keys WHERE account_id = ? ORDER BY created_at ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                Ok(ApiKeyInfo {
                    id: row.try_get("id").map_err(|e| e.to_string())?,
                    account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
                    key_prefix: row.try_get("key_prefix").map_err(|e| e.to_string())?,
                    created_at: parse_ts(row.try_get("created_at").map_err(|e| e.to_string())?)?
                        .ok_or_else(|| "api key missing created_at".to_string())?,
                    last_used_at: parse_ts(
                        row.try_get("last_used_at").map_err(|e| e.to_string())?,
                    )?,
                })
            })
            .collect()
    }

    /// Revokes by plaintext key or by key id; only keys of `account_id` match.
    pub async fn revoke_api_key(&self, account_id: &str, key_or_id: &str) -> Result<bool, String> {
        let result = sqlx::query(
            "DELETE FROM api_keys WHERE account_id = ? AND (key_hash = ? OR id = ?)",
        )
        .bind(account_id)
        .bind(Self::hash_key(key_or_id))
        .bind(key_or_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Maps an opaque API key to its active account.
    pub async fn lookup_api_key(&self, key: &str) -> Result<Option<Account>, String> {
        if !key.starts_with(API_KEY_PREFIX) {
            return Ok(None);
        }
        let key_hash = Self::hash_key(key);
        let row = sqlx::query("SELECT id, account_id FROM api_keys WHERE key_hash = ?")
            .bind(&key_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let key_id: String = row.try_get("id").map_err(|e| e.to_string())?;
        let account_id: String = row.try_get("account_id").map_err(|e| e.to_string())?;

        let Some(account) = self.get(&account_id).await? else {
            return Ok(None);
        };
        if !account.is_active() {
            return Ok(None);
        }

        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(&key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Some(account))
    }

    fn row_to_account(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Account, String> {
        let status_raw: String = row.try_get("status").map_err(|e| e.to_string())?;
        let status = AccountStatus::from_str(&status_raw)
            .ok_or_else(|| format!("invalid account status: {status_raw}"))?;
        Ok(Account {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            name: row.try_get("name").map_err(|e| e.to_string())?,
            login_token: row.try_get("login_token").map_err(|e| e.to_string())?,
            status,
            assigned_credential_id: row
                .try_get::<Option<String>, _>("assigned_credential_id")
                .map_err(|e| e.to_string())?
                .filter(|c| !c.is_empty()),
            balance: row.try_get("balance").map_err(|e| e.to_string())?,
            granted_total: row.try_get("granted_total").map_err(|e| e.to_string())?,
            quota: AccountQuota {
                daily_tokens: row.try_get("quota_daily_tokens").map_err(|e| e.to_string())?,
                monthly_tokens: row
                    .try_get("quota_monthly_tokens")
                    .map_err(|e| e.to_string())?,
                daily_requests: row
                    .try_get("quota_daily_requests")
                    .map_err(|e| e.to_string())?,
            },
            request_count: row.try_get("request_count").map_err(|e| e.to_string())?,
            flagged_for_review: row
                .try_get::<i32, _>("flagged_for_review")
                .map_err(|e| e.to_string())?
                == 1,
            last_overdraft: row.try_get("last_overdraft").map_err(|e| e.to_string())?,
            in_flight_requests: row
                .try_get("in_flight_requests")
                .map_err(|e| e.to_string())?,
            reserved_tokens: row.try_get("reserved_tokens").map_err(|e| e.to_string())?,
            created_at: parse_ts(row.try_get("created_at").map_err(|e| e.to_string())?)?
                .ok_or_else(|| "account missing created_at".to_string())?,
            last_used: parse_ts(row.try_get("last_used").map_err(|e| e.to_string())?)?,
        })
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut buf);
    hex::encode(buf)
}
