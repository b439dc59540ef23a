use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use std::fmt;

use crate::accounts::{Account, AccountStatus, AccountStore};
use crate::credentials::fmt_ts;
use crate::usage::{NewUsageRecord, UsageStore, start_of_day, start_of_month};

/// Reason a pre-check refused a request. Limits are carried so the client can
/// see which one ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDenial {
    AccountDisabled,
    BalanceExhausted { balance: i64 },
    /// Requests already in flight hold the rest of the balance.
    BalanceReserved { available: i64, estimated: i64 },
    DailyRequests { used: i64, limit: i64 },
    DailyTokens { used: i64, estimated: i64, limit: i64 },
    MonthlyTokens { used: i64, estimated: i64, limit: i64 },
}

impl QuotaDenial {
    pub fn reason(&self) -> &'static str {
        match self {
            QuotaDenial::AccountDisabled => "account_disabled",
            QuotaDenial::BalanceExhausted { .. } => "balance_exhausted",
            QuotaDenial::BalanceReserved { .. } => "balance_reserved",
            QuotaDenial::DailyRequests { .. } => "daily_requests",
            QuotaDenial::DailyTokens { .. } => "daily_tokens",
            QuotaDenial::MonthlyTokens { .. } => "monthly_tokens",
        }
    }
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaDenial::AccountDisabled => write!(f, "account is disabled"),
            QuotaDenial::BalanceExhausted { balance } => {
                write!(f, "token balance exhausted (balance {balance})")
            }
            QuotaDenial::BalanceReserved {
                available,
                estimated,
            } => write!(
                f,
                "token balance held by in-flight requests (available {available}, estimated {estimated})"
            ),
            QuotaDenial::DailyRequests { used, limit } => {
                write!(f, "daily request quota reached ({used}/{limit})")
            }
            QuotaDenial::DailyTokens {
                used,
                estimated,
                limit,
            } => write!(
                f,
                "daily token quota exceeded (used {used}, estimated {estimated}, limit {limit})"
            ),
            QuotaDenial::MonthlyTokens {
                used,
                estimated,
                limit,
            } => write!(
                f,
                "monthly token quota exceeded (used {used}, estimated {estimated}, limit {limit})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny(QuotaDenial),
}

/// Period counters the pre-check is evaluated against. Reservations of
/// in-flight requests live on the account itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodUsage {
    pub daily_requests: i64,
    pub daily_tokens: i64,
    pub monthly_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub usage_id: i64,
    pub balance_after: i64,
    pub overdraft: i64,
}

/// Pure pre-check. Conditions are evaluated in a fixed order and the first
/// failing one decides. A limit of zero means unlimited. Requests admitted
/// but not yet committed count against every limit.
pub fn evaluate(account: &Account, usage: PeriodUsage, estimated: i64) -> QuotaDecision {
    if account.status != AccountStatus::Active {
        return QuotaDecision::Deny(QuotaDenial::AccountDisabled);
    }
    if account.balance < 0 {
        return QuotaDecision::Deny(QuotaDenial::BalanceExhausted {
            balance: account.balance,
        });
    }
    let estimated = estimated.max(0);
    // The first request may overdraw; later ones must fit what is left.
    if account.in_flight_requests > 0 {
        let available = account.balance - account.reserved_tokens;
        if available.saturating_sub(estimated) < 0 {
            return QuotaDecision::Deny(QuotaDenial::BalanceReserved {
                available,
                estimated,
            });
        }
    }

    let quota = &account.quota;
    let requests = usage.daily_requests + account.in_flight_requests;
    if quota.daily_requests > 0 && requests >= quota.daily_requests {
        return QuotaDecision::Deny(QuotaDenial::DailyRequests {
            used: requests,
            limit: quota.daily_requests,
        });
    }
    let daily = usage.daily_tokens + account.reserved_tokens;
    if token_limit_hit(quota.daily_tokens, daily, estimated) {
        return QuotaDecision::Deny(QuotaDenial::DailyTokens {
            used: daily,
            estimated,
            limit: quota.daily_tokens,
        });
    }
    let monthly = usage.monthly_tokens + account.reserved_tokens;
    if token_limit_hit(quota.monthly_tokens, monthly, estimated) {
        return QuotaDecision::Deny(QuotaDenial::MonthlyTokens {
            used: monthly,
            estimated,
            limit: quota.monthly_tokens,
        });
    }
    QuotaDecision::Allow
}

fn token_limit_hit(limit: i64, used: i64, estimated: i64) -> bool {
    limit > 0 && (used >= limit || used.saturating_add(estimated.max(0)) > limit)
}

/// Same rules as [`evaluate`], applied by SQLite under its write lock so two
/// requests can never both take the last unit of a limit.
const RESERVE_SQL: &str = r#"WITH period AS (
        SELECT
            (SELECT COUNT(*) FROM usage_records
                WHERE account_id = ? AND recorded_at >= ?) AS day_requests,
            (SELECT COALESCE(SUM(prompt_tokens + completion_tokens), 0) FROM usage_records
                WHERE account_id = ? AND recorded_at >= ?) AS day_tokens,
            (SELECT COALESCE(SUM(prompt_tokens + completion_tokens), 0) FROM usage_records
                WHERE account_id = ? AND recorded_at >= ?) AS month_tokens
    )
    UPDATE accounts
    SET in_flight_requests = in_flight_requests + 1,
        reserved_tokens = reserved_tokens + ?
    WHERE id = ?
      AND status = 'active'
      AND balance >= 0
      AND (in_flight_requests = 0 OR balance - reserved_tokens - ? >= 0)
      AND (quota_daily_requests = 0
           OR (SELECT day_requests FROM period) + in_flight_requests < quota_daily_requests)
      AND (quota_daily_tokens = 0
           OR (SELECT day_tokens FROM period) + reserved_tokens + ? <= quota_daily_tokens
              AND (SELECT day_tokens FROM period) + reserved_tokens < quota_daily_tokens)
      AND (quota_monthly_tokens = 0
           OR (SELECT month_tokens FROM period) + reserved_tokens + ? <= quota_monthly_tokens
              AND (SELECT month_tokens FROM period) + reserved_tokens < quota_monthly_tokens)
    RETURNING in_flight_requests"#;

const MAX_RESERVE_ATTEMPTS: usize = 8;

/// Outcome of admission control.
pub enum Admission {
    Admitted(QuotaReservation),
    Denied(QuotaDenial),
}

/// Hold on an account's in-flight counters. Consumed by
/// [`QuotaEnforcer::commit`] or [`QuotaEnforcer::cancel`]; dropping it
/// unsettled returns the hold in the background.
pub struct QuotaReservation {
    account_id: String,
    tokens: i64,
    accounts: AccountStore,
    settled: bool,
}

impl QuotaReservation {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let accounts = self.accounts.clone();
        let account_id = self.account_id.clone();
        let tokens = self.tokens;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Err(err) = accounts.release_reservation(&account_id, tokens).await {
                tracing::warn!(account_id = %account_id, "failed to release dropped reservation: {err}");
            }
        });
    }
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    db: Pool<Sqlite>,
    accounts: AccountStore,
    usage: UsageStore,
}

impl QuotaEnforcer {
    pub fn new(db: Pool<Sqlite>, accounts: AccountStore, usage: UsageStore) -> Self {
        Self {
            db,
            accounts,
            usage,
        }
    }

    pub async fn period_usage(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PeriodUsage, String> {
        let day = start_of_day(now);
        Ok(PeriodUsage {
            daily_requests: self.usage.request_count_since(account_id, day).await?,
            daily_tokens: self.usage.token_sum_since(account_id, day).await?,
            monthly_tokens: self
                .usage
                .token_sum_since(account_id, start_of_month(now))
                .await?,
        })
    }

    /// Admission control. Reads the account fresh, explains a refusal with
    /// [`evaluate`], and otherwise takes a reservation with one conditional
    /// UPDATE. A lost race re-reads and decides again.
    pub async fn check(&self, account: &Account, estimated: i64) -> Result<Admission, String> {
        let estimated = estimated.max(0);
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let Some(current) = self.accounts.get(&account.id).await? else {
                return Ok(self.deny(&account.id, QuotaDenial::AccountDisabled, estimated));
            };
            let now = Utc::now();
            let usage = if current.is_active() && current.balance >= 0 {
                self.period_usage(&current.id, now).await?
            } else {
                PeriodUsage::default()
            };
            if let QuotaDecision::Deny(denial) = evaluate(&current, usage, estimated) {
                return Ok(self.deny(&current.id, denial, estimated));
            }
            if self.try_reserve(&current.id, estimated, now).await? {
                return Ok(Admission::Admitted(QuotaReservation {
                    account_id: current.id,
                    tokens: estimated,
                    accounts: self.accounts.clone(),
                    settled: false,
                }));
            }
            tracing::debug!(account_id = %current.id, "quota reservation raced; re-checking");
        }
        Err(format!(
            "quota reservation for account {} kept racing",
            account.id
        ))
    }

    fn deny(&self, account_id: &str, denial: QuotaDenial, estimated: i64) -> Admission {
        metrics::counter!("apollo_quota_denied_total", "reason" => denial.reason()).increment(1);
        tracing::debug!(
            account_id = %account_id,
            reason = denial.reason(),
            estimated,
            "quota pre-check denied request"
        );
        Admission::Denied(denial)
    }

    async fn try_reserve(
        &self,
        account_id: &str,
        estimated: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        let day = fmt_ts(start_of_day(now));
        let month = fmt_ts(start_of_month(now));
        let row = sqlx::query(RESERVE_SQL)
            .bind(account_id)
            .bind(&day)
            .bind(account_id)
            .bind(&day)
            .bind(account_id)
            .bind(&month)
            .bind(estimated)
            .bind(account_id)
            .bind(estimated)
            .bind(estimated)
            .bind(estimated)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| e.to_string())?;
        Ok(row.is_some())
    }

    /// Returns an unused reservation, e.g. when forwarding failed.
    pub async fn cancel(&self, mut reservation: QuotaReservation) -> Result<(), String> {
        self.accounts
            .release_reservation(&reservation.account_id, reservation.tokens)
            .await?;
        reservation.settled = true;
        Ok(())
    }

    /// Appends the usage record, debits the balance and returns the
    /// reservation in one transaction. Overdraft is allowed and flags the
    /// account.
    pub async fn commit(
        &self,
        mut reservation: QuotaReservation,
        record: NewUsageRecord,
        strict_balance: bool,
    ) -> Result<CommitOutcome, String> {
        let now = Utc::now();
        let total = i64::try_from(record.total_tokens()).map_err(|e| e.to_string())?;

        let mut tx = self.db.begin().await.map_err(|e| e.to_string())?;
        let usage_id = UsageStore::append_tx(&mut tx, &record, now).await?;
        let debit = AccountStore::debit_tx(&mut tx, &record.account_id, total, strict_balance, now)
            .await?
            .ok_or_else(|| format!("account {} not found", record.account_id))?;
        AccountStore::release_reservation_tx(&mut tx, &reservation.account_id, reservation.tokens)
            .await?;
        tx.commit().await.map_err(|e| e.to_string())?;
        reservation.settled = true;

        metrics::counter!("apollo_tokens_committed_total").increment(record.total_tokens());
        if debit.overdraft > 0 {
            tracing::warn!(
                account_id = %record.account_id,
                overdraft = debit.overdraft,
                balance = debit.balance_after,
                "usage commit overdrew balance; account flagged for review"
            );
        } else {
            tracing::debug!(
                account_id = %record.account_id,
                model = %record.model,
                prompt_tokens = record.prompt_tokens,
                completion_tokens = record.completion_tokens,
                estimated = record.estimated,
                balance = debit.balance_after,
                "usage committed"
            );
        }

        Ok(CommitOutcome {
            usage_id,
            balance_after: debit.balance_after,
            overdraft: debit.overdraft,
        })
    }

    /// Deletes the account's usage history and zeroes its request counter.
    pub async fn reset_usage(&self, account_id: &str) -> Result<u64, String> {
        let deleted = self.usage.delete_for_account(account_id).await?;
        self.accounts.reset_request_count(account_id).await?;
        tracing::info!(account_id = %account_id, deleted, "account usage reset");
        Ok(deleted)
    }
}
