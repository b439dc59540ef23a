//! Exclusive credential leasing.
//!
//! Every lease transition is a conditional UPDATE against the shared store, so
//! exclusivity holds across any number of gateway instances. In-process state
//! (the rotation cursor and the wake-up notifier) only affects fairness and
//! latency, never correctness.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::credentials::{Credential, CredentialStore, RefreshedTokens};
use crate::settings::GatewaySettings;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    /// Upstream refused the credential itself; it is disabled for good.
    UpstreamRejectedAuth(String),
    /// Network error, 5xx or timeout; the credential goes back unchanged.
    Transient(Option<String>),
    /// Credential is parked as exhausted until its cooldown elapses.
    RateLimited,
}

impl ReleaseOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReleaseOutcome::Success => "success",
            ReleaseOutcome::UpstreamRejectedAuth(_) => "rejected",
            ReleaseOutcome::Transient(_) => "transient",
            ReleaseOutcome::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no credential available")]
    NoCredentialAvailable,
    #[error("credential store error: {0}")]
    Store(String),
}

#[derive(Debug, Default, Clone)]
pub struct AcquireConstraints {
    /// Sticky credential of the account, tried before global rotation.
    pub preferred: Option<String>,
    /// Credentials already tried by this request.
    pub exclude: HashSet<String>,
}

#[derive(Clone)]
pub struct CredentialPool {
    store: CredentialStore,
    cursor: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

/// Exclusive, time-bounded claim on one credential. Dropping a lease without
/// calling [`CredentialPool::release`] hands it back as a transient failure.
pub struct CredentialLease {
    credential: Credential,
    lease_id: String,
    pool: CredentialPool,
    released: bool,
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("credential_id", &self.credential.id)
            .field("lease_id", &self.lease_id)
            .finish()
    }
}

impl CredentialLease {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn credential_id(&self) -> &str {
        &self.credential.id
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// Writes refreshed tokens through the lease. Returns false if the lease
    /// was lost (expired and taken over), in which case nothing is written.
    pub async fn persist_refreshed(&mut self, tokens: RefreshedTokens) -> Result<bool, String> {
        let written = self
            .pool
            .store
            .update_tokens_under_lease(&self.credential.id, &self.lease_id, &tokens)
            .await?;
        if written {
            self.credential.access_token = Some(tokens.access_token);
            if let Some(refresh_token) = tokens.refresh_token {
                self.credential.refresh_token = refresh_token;
            }
            self.credential.expires_at = tokens.expires_at;
            if tokens.profile_arn.is_some() {
                self.credential.profile_arn = tokens.profile_arn;
            }
        }
        Ok(written)
    }

    /// Extends the lease by `ttl` from now. Returns false once the lease
    /// has been lost; the holder must stop using the credential.
    pub async fn renew(&self, ttl: Duration) -> Result<bool, String> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| e.to_string())?;
        let renewed = self
            .pool
            .store
            .extend_lease(&self.credential.id, &self.lease_id, Utc::now() + ttl)
            .await?;
        if !renewed {
            tracing::warn!(
                credential_id = %self.credential.id,
                lease_id = %self.lease_id,
                "lease lost before renewal"
            );
        }
        Ok(renewed)
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.pool.store.clone();
        let notify = self.pool.released.clone();
        let id = self.credential.id.clone();
        let lease_id = self.lease_id.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            match store
                .release_transient(&id, &lease_id, Some("lease dropped"))
                .await
            {
                Ok(_) => notify.notify_waiters(),
                Err(err) => {
                    tracing::warn!(credential_id = %id, "failed to release dropped lease: {err}")
                }
            }
        });
    }
}

impl CredentialPool {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            cursor: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Leases a credential, waiting up to `acquire_wait_ms` for one to free up
    /// (0 fails fast).
    pub async fn acquire(
        &self,
        constraints: &AcquireConstraints,
        settings: &GatewaySettings,
    ) -> Result<CredentialLease, PoolError> {
        let deadline = Instant::now() + Duration::from_millis(settings.acquire_wait_ms);
        let mut fallback_logged = false;
        loop {
            // Register interest before scanning so a release between the scan
            // and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self
                .try_acquire_once(constraints, settings, &mut fallback_logged)
                .await?
            {
                metrics::counter!("apollo_credential_acquire_total", "result" => "leased")
                    .increment(1);
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::counter!("apollo_credential_acquire_total", "result" => "unavailable")
                    .increment(1);
                return Err(PoolError::NoCredentialAvailable);
            }
            let wait = (deadline - now).min(WAIT_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn try_acquire_once(
        &self,
        constraints: &AcquireConstraints,
        settings: &GatewaySettings,
        fallback_logged: &mut bool,
    ) -> Result<Option<CredentialLease>, PoolError> {
        if let Some(preferred) = constraints.preferred.as_deref() {
            if !constraints.exclude.contains(preferred) {
                if let Some(lease) = self.try_lease(preferred, settings).await? {
                    return Ok(Some(lease));
                }
                if !*fallback_logged {
                    *fallback_logged = true;
                    tracing::warn!(
                        credential_id = %preferred,
                        "assigned credential unavailable, falling back to global rotation"
                    );
                }
            }
        }

        let candidates = self
            .store
            .list_selectable(Utc::now())
            .await
            .map_err(PoolError::Store)?;
        let candidates: Vec<(String, Option<String>)> = candidates
            .into_iter()
            .filter(|(id, _)| !constraints.exclude.contains(id))
            .filter(|(id, _)| constraints.preferred.as_deref() != Some(id.as_str()))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let offset = self.cursor.fetch_add(1, Ordering::Relaxed);
        for id in rotate_ties(candidates, offset) {
            if let Some(lease) = self.try_lease(&id, settings).await? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    async fn try_lease(
        &self,
        id: &str,
        settings: &GatewaySettings,
    ) -> Result<Option<CredentialLease>, PoolError> {
        let lease_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(settings.lease_ttl_seconds as i64);
        let won = self
            .store
            .try_lease(id, &lease_id, now, now + ttl)
            .await
            .map_err(PoolError::Store)?;
        if !won {
            return Ok(None);
        }
        let credential = self
            .store
            .get(id)
            .await
            .map_err(PoolError::Store)?
            .ok_or_else(|| PoolError::Store(format!("leased credential {id} disappeared")))?;
        tracing::debug!(credential_id = %id, lease_id = %lease_id, "credential leased");
        Ok(Some(CredentialLease {
            credential,
            lease_id,
            pool: self.clone(),
            released: false,
        }))
    }

    /// Ends a lease with the given outcome.
    pub async fn release(
        &self,
        mut lease: CredentialLease,
        outcome: ReleaseOutcome,
        settings: &GatewaySettings,
    ) -> Result<(), String> {
        let id = lease.credential.id.clone();
        let lease_id = lease.lease_id.clone();
        let now = Utc::now();

        let applied = match &outcome {
            ReleaseOutcome::Success => self.store.release_success(&id, &lease_id, now).await?,
            ReleaseOutcome::UpstreamRejectedAuth(reason) => {
                let applied = self.store.release_disabled(&id, &lease_id, reason).await?;
                if applied {
                    tracing::info!(credential_id = %id, reason = %reason, "credential disabled after upstream rejection");
                }
                applied
            }
            ReleaseOutcome::Transient(reason) => {
                self.store
                    .release_transient(&id, &lease_id, reason.as_deref())
                    .await?
            }
            ReleaseOutcome::RateLimited => {
                let cooldown = chrono::Duration::seconds(settings.rate_limit_cooldown_seconds as i64);
                let applied = self
                    .store
                    .release_exhausted(&id, &lease_id, now + cooldown)
                    .await?;
                if applied {
                    tracing::info!(
                        credential_id = %id,
                        cooldown_seconds = settings.rate_limit_cooldown_seconds,
                        "credential exhausted by rate limit"
                    );
                }
                applied
            }
        };
        // A failed store call leaves the lease to the drop path.
        lease.released = true;

        metrics::counter!("apollo_credential_release_total", "outcome" => outcome.label())
            .increment(1);
        if !applied {
            tracing::warn!(
                credential_id = %id,
                lease_id = %lease_id,
                outcome = outcome.label(),
                "lease no longer held at release; transition skipped"
            );
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// Returns exhausted credentials whose cooldown elapsed to the active set.
    pub async fn reactivate_cooled_down(&self) -> Result<u64, String> {
        let count = self.store.reactivate_cooled_down(Utc::now()).await?;
        if count > 0 {
            tracing::info!(count, "exhausted credentials reactivated after cooldown");
            self.released.notify_waiters();
        }
        Ok(count)
    }
}

/// Keeps least-recently-used order, rotating each run of equal `last_used`
/// values by `offset` so ties are served round-robin.
fn rotate_ties(candidates: Vec<(String, Option<String>)>, offset: usize) -> Vec<String> {
    let mut ordered = Vec::with_capacity(candidates.len());
    let mut group: Vec<String> = Vec::new();
    let mut group_key: Option<Option<String>> = None;

    for (id, last_used) in candidates {
        if group_key.as_ref() != Some(&last_used) {
            flush_group(&mut group, &mut ordered, offset);
            group_key = Some(last_used);
        }
        group.push(id);
    }
    flush_group(&mut group, &mut ordered, offset);
    ordered
}

fn flush_group(group: &mut Vec<String>, ordered: &mut Vec<String>, offset: usize) {
    if group.is_empty() {
        return;
    }
    let shift = offset % group.len();
    group.rotate_left(shift);
    ordered.append(group);
}
