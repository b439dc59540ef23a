//! Per-request composition: quota admission, model resolution, forwarding,
//! and the usage commit that settles the admission.

use axum::response::sse::Event;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::accounts::Account;
use crate::error::GatewayError;
use crate::forwarder::{ForwardRequest, Forwarder, OpenedStream, relay_stream};
use crate::mappings::MappingStore;
use crate::pool::{CredentialPool, ReleaseOutcome};
use crate::quota::{Admission, QuotaEnforcer, QuotaReservation};
use crate::settings::{GatewaySettings, SettingsStore};
use crate::tokens;
use crate::usage::NewUsageRecord;

#[derive(Clone)]
pub struct Gateway {
    pub settings: SettingsStore,
    pub mappings: MappingStore,
    pub pool: CredentialPool,
    pub quota: QuotaEnforcer,
    pub forwarder: Forwarder,
}

pub enum ChatReply {
    Complete(Value),
    Stream(mpsc::Receiver<Event>),
}

impl Gateway {
    pub async fn chat_completions(
        &self,
        account: &Account,
        requested_model: &str,
        body: Value,
        stream: bool,
    ) -> Result<ChatReply, GatewayError> {
        let settings = self
            .settings
            .get_all()
            .await
            .map_err(GatewayError::Internal)?;

        let estimated =
            tokens::estimate_request_cost(&body, settings.estimate_max_completion_tokens);
        let admission = self
            .quota
            .check(account, i64::try_from(estimated).unwrap_or(i64::MAX))
            .await
            .map_err(GatewayError::Internal)?;
        let reservation = match admission {
            Admission::Admitted(reservation) => reservation,
            Admission::Denied(denial) => return Err(GatewayError::QuotaExceeded(denial)),
        };

        // Detached: a client hanging up must not cancel an upstream call the
        // account will be charged for.
        let gateway = self.clone();
        let account = account.clone();
        let requested_model = requested_model.to_string();
        tokio::spawn(async move {
            gateway
                .dispatch(reservation, &account, &requested_model, body, stream, settings)
                .await
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("dispatch task failed: {e}")))?
    }

    async fn dispatch(
        &self,
        reservation: QuotaReservation,
        account: &Account,
        requested_model: &str,
        body: Value,
        stream: bool,
        settings: GatewaySettings,
    ) -> Result<ChatReply, GatewayError> {
        let resolved = match self.mappings.resolve(requested_model).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.cancel_reservation(reservation).await;
                return Err(GatewayError::Internal(err));
            }
        };
        tracing::debug!(
            account_id = %account.id,
            model = %requested_model,
            resolved = ?resolved,
            stream,
            "routing chat completion"
        );

        let req = ForwardRequest {
            account,
            requested_model,
            resolved: &resolved,
            body: &body,
        };

        if stream {
            let opened = match self.forwarder.open_stream(&self.pool, &req, &settings).await {
                Ok(opened) => opened,
                Err(err) => {
                    self.cancel_reservation(reservation).await;
                    return Err(err);
                }
            };
            let prompt_estimate = tokens::estimate_prompt_tokens(&body);
            return Ok(ChatReply::Stream(self.spawn_stream(
                opened,
                reservation,
                requested_model.to_string(),
                prompt_estimate,
                settings,
            )));
        }

        let forwarded = match self.forwarder.forward(&self.pool, &req, &settings).await {
            Ok(forwarded) => forwarded,
            Err(err) => {
                self.cancel_reservation(reservation).await;
                return Err(err);
            }
        };
        let record = NewUsageRecord {
            account_id: account.id.clone(),
            model: forwarded.target.clone(),
            prompt_tokens: forwarded.usage.prompt_tokens,
            completion_tokens: forwarded.usage.completion_tokens,
            credential_id: Some(forwarded.credential_id.clone()),
            estimated: forwarded.estimated,
        };
        if let Err(err) = self
            .quota
            .commit(reservation, record, settings.strict_balance)
            .await
        {
            tracing::warn!(
                account_id = %account.id,
                credential_id = %forwarded.credential_id,
                "failed to commit usage: {err}"
            );
        }
        Ok(ChatReply::Complete(forwarded.body))
    }

    async fn cancel_reservation(&self, reservation: QuotaReservation) {
        let account_id = reservation.account_id().to_string();
        if let Err(err) = self.quota.cancel(reservation).await {
            tracing::warn!(account_id = %account_id, "failed to release quota reservation: {err}");
        }
    }

    /// Relays the stream on its own task so that lease release and usage
    /// commit happen even if the client goes away.
    fn spawn_stream(
        &self,
        opened: OpenedStream,
        reservation: QuotaReservation,
        requested_model: String,
        prompt_estimate: u64,
        settings: GatewaySettings,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel::<Event>(64);
        let gateway = self.clone();
        tokio::spawn(async move {
            let OpenedStream {
                response,
                lease,
                target,
            } = opened;
            let account_id = reservation.account_id().to_string();
            let idle = Duration::from_millis(settings.request_timeout_ms.max(1));
            let outcome = relay_stream(
                response,
                tx,
                &lease,
                &requested_model,
                prompt_estimate,
                idle,
                settings.lease_ttl(),
            )
            .await;

            let credential_id = lease.credential_id().to_string();
            let release = match &outcome.error {
                None => ReleaseOutcome::Success,
                Some(err) => ReleaseOutcome::Transient(Some(err.message.clone())),
            };
            if let Err(err) = gateway.pool.release(lease, release, &settings).await {
                tracing::warn!(credential_id = %credential_id, "failed to release lease: {err}");
            }
            if outcome.client_disconnected {
                tracing::info!(
                    account_id = %account_id,
                    credential_id = %credential_id,
                    "client disconnected mid-stream; accounting upstream call anyway"
                );
            }

            if !outcome.should_commit() {
                tracing::debug!(
                    account_id = %account_id,
                    credential_id = %credential_id,
                    "stream failed before delivering content; no usage committed"
                );
                gateway.cancel_reservation(reservation).await;
                return;
            }
            let record = NewUsageRecord {
                account_id: account_id.clone(),
                model: target,
                prompt_tokens: outcome.usage.prompt_tokens,
                completion_tokens: outcome.usage.completion_tokens,
                credential_id: Some(credential_id.clone()),
                estimated: outcome.estimated,
            };
            if let Err(err) = gateway
                .quota
                .commit(reservation, record, settings.strict_balance)
                .await
            {
                tracing::warn!(
                    account_id = %account_id,
                    credential_id = %credential_id,
                    "failed to commit stream usage: {err}"
                );
            }
        });
        rx
    }
}
