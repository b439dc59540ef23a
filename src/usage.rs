use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;

use crate::credentials::fmt_ts;

/// Immutable fact of tokens consumed by one completed upstream call.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub account_id: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub credential_id: Option<String>,
    pub estimated: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub account_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub credential_id: Option<String>,
    pub estimated: bool,
}

impl NewUsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UsageBucket {
    pub prompt: i64,
    pub completion: i64,
    pub requests: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub total_requests: i64,
    pub by_model: BTreeMap<String, UsageBucket>,
    pub by_date: BTreeMap<String, UsageBucket>,
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

pub fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive().with_day(1).unwrap_or_else(|| now.date_naive());
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}

enum UsageScope<'a> {
    Account(&'a str),
    Credential(&'a str),
    All,
}

#[derive(Clone)]
pub struct UsageStore {
    pool: Pool<Sqlite>,
}

impl UsageStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                credential_id TEXT,
                estimated INTEGER NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_account_time ON usage_records(account_id, recorded_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_credential ON usage_records(credential_id)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    /// Appends a record inside the caller's transaction.
    pub async fn append_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        record: &NewUsageRecord,
        recorded_at: DateTime<Utc>,
    ) -> Result<i64, String> {
        let prompt = i64::try_from(record.prompt_tokens).map_err(|e| e.to_string())?;
        let completion = i64::try_from(record.completion_tokens).map_err(|e| e.to_string())?;
        let result = sqlx::query(
            r#"INSERT INTO usage_records (account_id, model, prompt_tokens, completion_tokens, credential_id, estimated, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.account_id)
        .bind(&record.model)
        .bind(prompt)
        .bind(completion)
        .bind(&record.credential_id)
        .bind(if record.estimated { 1 } else { 0 })
        .bind(fmt_ts(recorded_at))
        .execute(&mut **tx)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.last_insert_rowid())
    }

    pub async fn token_sum_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, String> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(prompt_tokens + completion_tokens), 0) AS total FROM usage_records WHERE account_id = ? AND recorded_at >= ?",
        )
        .bind(account_id)
        .bind(fmt_ts(since))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.try_get("total").map_err(|e| e.to_string())
    }

    pub async fn request_count_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, String> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM usage_records WHERE account_id = ? AND recorded_at >= ?",
        )
        .bind(account_id)
        .bind(fmt_ts(since))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.try_get("cnt").map_err(|e| e.to_string())
    }

    pub async fn list_for_account(&self, account_id: &str) -> Result<Vec<UsageRecord>, String> {
        let rows = sqlx::query(
            "SELECT id, account_id, model, prompt_tokens, completion_tokens, credential_id, estimated, recorded_at FROM usage_records WHERE account_id = ? ORDER BY id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn account_summary(&self, account_id: &str) -> Result<UsageSummary, String> {
        self.summary(UsageScope::Account(account_id)).await
    }

    pub async fn credential_summary(&self, credential_id: &str) -> Result<UsageSummary, String> {
        self.summary(UsageScope::Credential(credential_id)).await
    }

    pub async fn global_summary(&self) -> Result<UsageSummary, String> {
        self.summary(UsageScope::All).await
    }

    /// Removes an account's history. Operator action only.
    pub async fn delete_for_account(&self, account_id: &str) -> Result<u64, String> {
        let result = sqlx::query("DELETE FROM usage_records WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected())
    }

    async fn summary(&self, scope: UsageScope<'_>) -> Result<UsageSummary, String> {
        let (where_clause, bind_value) = match scope {
            UsageScope::Account(id) => ("WHERE account_id = ?", Some(id)),
            UsageScope::Credential(id) => ("WHERE credential_id = ?", Some(id)),
            UsageScope::All => ("", None),
        };

        let by_model_sql = format!(
            "SELECT model AS k, COALESCE(SUM(prompt_tokens), 0) AS p, COALESCE(SUM(completion_tokens), 0) AS c, COUNT(*) AS r FROM usage_records {where_clause} GROUP BY model"
        );
        let by_date_sql = format!(
            "SELECT substr(recorded_at, 1, 10) AS k, COALESCE(SUM(prompt_tokens), 0) AS p, COALESCE(SUM(completion_tokens), 0) AS c, COUNT(*) AS r FROM usage_records {where_clause} GROUP BY k"
        );

        let mut summary = UsageSummary::default();
        for (sql, is_model) in [(by_model_sql, true), (by_date_sql, false)] {
            let mut query = sqlx::query(&sql);
            if let Some(v) = bind_value {
                query = query.bind(v);
            }
            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            for row in rows {
                let key: String = row.try_get("k").map_err(|e| e.to_string())?;
                let bucket = UsageBucket {
                    prompt: row.try_get("p").map_err(|e| e.to_string())?,
                    completion: row.try_get("c").map_err(|e| e.to_string())?,
                    requests: row.try_get("r").map_err(|e| e.to_string())?,
                };
                if is_model {
                    summary.total_prompt_tokens += bucket.prompt;
                    summary.total_completion_tokens += bucket.completion;
                    summary.total_requests += bucket.requests;
                    summary.by_model.insert(key, bucket);
                } else {
                    summary.by_date.insert(key, bucket);
                }
            }
        }
        summary.total_tokens = summary.total_prompt_tokens + summary.total_completion_tokens;
        Ok(summary)
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<UsageRecord, String> {
    let recorded_at: String = row.try_get("recorded_at").map_err(|e| e.to_string())?;
    Ok(UsageRecord {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        model: row.try_get("model").map_err(|e| e.to_string())?,
        prompt_tokens: row.try_get("prompt_tokens").map_err(|e| e.to_string())?,
        completion_tokens: row.try_get("completion_tokens").map_err(|e| e.to_string())?,
        credential_id: row.try_get("credential_id").map_err(|e| e.to_string())?,
        estimated: row.try_get::<i32, _>("estimated").map_err(|e| e.to_string())? == 1,
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .map_err(|e| e.to_string())?
            .with_timezone(&Utc),
    })
}
