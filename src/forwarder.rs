//! Outbound leg of a request: refreshes the leased credential if needed,
//! walks the resolved targets, classifies failures, and relays or buffers
//! the upstream response together with its token usage.

use axum::http::StatusCode;
use axum::response::sse::Event;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::accounts::Account;
use crate::error::{GatewayError, TargetFailure};
use crate::mappings::ResolvedTarget;
use crate::pool::{AcquireConstraints, CredentialLease, CredentialPool, PoolError, ReleaseOutcome};
use crate::refresh::{RefreshEndpoints, RefreshError, refresh_credential};
use crate::settings::GatewaySettings;
use crate::tokens::{self, Usage};
use crate::upstream::{self, FailureClass, UpstreamCallError};

#[derive(Clone)]
pub struct Forwarder {
    http: reqwest::Client,
    base_url: String,
    refresh: RefreshEndpoints,
}

/// One inbound chat request as seen by the forwarder.
pub struct ForwardRequest<'a> {
    pub account: &'a Account,
    pub requested_model: &'a str,
    pub resolved: &'a ResolvedTarget,
    pub body: &'a Value,
}

/// A buffered upstream response. The lease is already released.
#[derive(Debug)]
pub struct Forwarded {
    pub body: Value,
    pub usage: Usage,
    pub estimated: bool,
    pub target: String,
    pub credential_id: String,
}

/// An upstream stream whose headers arrived. The lease stays held until the
/// caller has drained the body.
pub struct OpenedStream {
    pub response: reqwest::Response,
    pub lease: CredentialLease,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub estimated: bool,
    /// Upstream signalled the end of the stream.
    pub completed: bool,
    /// At least one content chunk reached the relay.
    pub delivered: bool,
    pub client_disconnected: bool,
    pub error: Option<UpstreamCallError>,
}

impl StreamOutcome {
    /// Usage is charged for completed streams and for partial ones that
    /// delivered content. A stream that failed before delivering anything
    /// is not charged.
    pub fn should_commit(&self) -> bool {
        self.completed || self.delivered
    }
}

#[derive(Debug, Clone)]
struct AttemptFailure {
    class: FailureClass,
    status: Option<StatusCode>,
    code: Option<String>,
    message: String,
}

impl From<UpstreamCallError> for AttemptFailure {
    fn from(err: UpstreamCallError) -> Self {
        Self {
            class: err.class(),
            status: err.status,
            code: err.code,
            message: err.message,
        }
    }
}

impl From<RefreshError> for AttemptFailure {
    fn from(err: RefreshError) -> Self {
        let class = match &err {
            RefreshError::Rejected(_) => FailureClass::RejectedAuth,
            RefreshError::Transient(_) => FailureClass::Transient,
        };
        Self {
            class,
            status: None,
            code: None,
            message: err.to_string(),
        }
    }
}

enum Dispatch {
    Buffered(Value),
    Streaming(reqwest::Response),
}

impl Forwarder {
    pub fn new(http: reqwest::Client, base_url: String, refresh: RefreshEndpoints) -> Self {
        Self {
            http,
            base_url,
            refresh,
        }
    }

    /// Refreshes the leased credential's access token when it is missing or
    /// about to expire, and writes the new tokens through the lease.
    pub async fn ensure_fresh_token(
        &self,
        lease: &mut CredentialLease,
        settings: &GatewaySettings,
    ) -> Result<(), RefreshError> {
        let skew = chrono::Duration::seconds(settings.refresh_skew_seconds as i64);
        let credential = lease.credential();
        if !credential.access_token_stale(Utc::now(), skew) {
            return Ok(());
        }
        if !credential.has_refresh_token() {
            // Still inside the skew window; use it while it lasts.
            if credential
                .access_token
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty())
                && credential.expires_at.is_none_or(|at| at > Utc::now())
            {
                return Ok(());
            }
            return Err(RefreshError::Rejected(
                "access token expired and no refresh token".to_string(),
            ));
        }

        let tokens = refresh_credential(
            &self.http,
            &self.refresh,
            credential,
            settings.request_timeout_ms,
        )
        .await?;
        let written = lease
            .persist_refreshed(tokens)
            .await
            .map_err(RefreshError::Transient)?;
        if !written {
            return Err(RefreshError::Transient(
                "lease lost while refreshing".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn forward(
        &self,
        pool: &CredentialPool,
        req: &ForwardRequest<'_>,
        settings: &GatewaySettings,
    ) -> Result<Forwarded, GatewayError> {
        let (dispatch, lease, target) = self.dispatch(pool, req, false, settings).await?;
        let Dispatch::Buffered(mut body) = dispatch else {
            return Err(GatewayError::Internal(
                "unexpected streaming dispatch".to_string(),
            ));
        };
        let credential_id = lease.credential_id().to_string();
        if let Err(err) = pool.release(lease, ReleaseOutcome::Success, settings).await {
            tracing::warn!(credential_id = %credential_id, "failed to release lease: {err}");
        }

        let (usage, estimated) = match tokens::parse_usage(&body) {
            Some(usage) => (usage, false),
            None => {
                let usage = Usage {
                    prompt_tokens: tokens::estimate_prompt_tokens(req.body),
                    completion_tokens: tokens::estimate_text_tokens(&tokens::completion_text(
                        &body,
                    )),
                };
                tracing::debug!(
                    target_model = %target,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "upstream omitted usage; estimated"
                );
                (usage, true)
            }
        };
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(req.requested_model.to_string()),
            );
            if estimated {
                obj.insert("usage".to_string(), usage.to_json());
            }
        }

        Ok(Forwarded {
            body,
            usage,
            estimated,
            target,
            credential_id,
        })
    }

    pub async fn open_stream(
        &self,
        pool: &CredentialPool,
        req: &ForwardRequest<'_>,
        settings: &GatewaySettings,
    ) -> Result<OpenedStream, GatewayError> {
        let (dispatch, lease, target) = self.dispatch(pool, req, true, settings).await?;
        match dispatch {
            Dispatch::Streaming(response) => Ok(OpenedStream {
                response,
                lease,
                target,
            }),
            Dispatch::Buffered(_) => {
                pool.release(lease, ReleaseOutcome::Transient(None), settings)
                    .await
                    .map_err(GatewayError::Internal)?;
                Err(GatewayError::Internal(
                    "unexpected buffered dispatch".to_string(),
                ))
            }
        }
    }

    /// Walks the targets in order. Within a target, a credential that is
    /// rejected or rate limited is released accordingly and the call is
    /// retried on another one, up to `max_credential_attempts` with
    /// exponential backoff. Transient failures move a combo to its next
    /// target and retry a single target in place.
    async fn dispatch(
        &self,
        pool: &CredentialPool,
        req: &ForwardRequest<'_>,
        stream: bool,
        settings: &GatewaySettings,
    ) -> Result<(Dispatch, CredentialLease, String), GatewayError> {
        let targets = req.resolved.targets();
        let is_combo = req.resolved.is_combo();
        let max_attempts = settings.max_credential_attempts.max(1);
        let mut constraints = AcquireConstraints {
            preferred: req.account.assigned_credential_id.clone(),
            exclude: HashSet::new(),
        };
        let mut failures: Vec<TargetFailure> = Vec::new();
        let mut last_failure: Option<AttemptFailure> = None;

        for target in targets {
            let upstream_body = build_upstream_body(req.body, target, stream);
            let mut target_failure: Option<AttemptFailure> = None;

            for attempt in 1..=max_attempts {
                if attempt > 1 {
                    tokio::time::sleep(settings.backoff_for_attempt(attempt - 1)).await;
                }
                let mut lease = match pool.acquire(&constraints, settings).await {
                    Ok(lease) => lease,
                    Err(PoolError::NoCredentialAvailable) => {
                        if target_failure.is_none() && failures.is_empty() {
                            return Err(GatewayError::NoCredentialAvailable);
                        }
                        if target_failure.is_none() {
                            target_failure = Some(AttemptFailure {
                                class: FailureClass::Transient,
                                status: None,
                                code: None,
                                message: "no credential available".to_string(),
                            });
                        }
                        break;
                    }
                    Err(PoolError::Store(err)) => return Err(GatewayError::Internal(err)),
                };

                let credential_id = lease.credential_id().to_string();
                tracing::debug!(
                    account_id = %req.account.id,
                    credential_id = %credential_id,
                    model = %req.requested_model,
                    target_model = %target,
                    attempt,
                    "dispatching upstream call"
                );

                let result = match self.ensure_fresh_token(&mut lease, settings).await {
                    Ok(()) => self
                        .call_target(&lease, &upstream_body, stream, settings)
                        .await
                        .map_err(AttemptFailure::from),
                    Err(err) => Err(AttemptFailure::from(err)),
                };
                let failure = match result {
                    Ok(dispatch) => return Ok((dispatch, lease, target.to_string())),
                    Err(failure) => failure,
                };

                tracing::warn!(
                    credential_id = %credential_id,
                    target_model = %target,
                    class = ?failure.class,
                    status = ?failure.status,
                    "upstream attempt failed: {}",
                    failure.message
                );
                let outcome = match failure.class {
                    FailureClass::RejectedAuth => {
                        ReleaseOutcome::UpstreamRejectedAuth(failure.message.clone())
                    }
                    FailureClass::RateLimited => ReleaseOutcome::RateLimited,
                    FailureClass::Transient | FailureClass::Client => {
                        ReleaseOutcome::Transient(Some(failure.message.clone()))
                    }
                };
                if let Err(err) = pool.release(lease, outcome, settings).await {
                    tracing::warn!(credential_id = %credential_id, "failed to release lease: {err}");
                }

                let class = failure.class;
                target_failure = Some(failure);
                match class {
                    FailureClass::RejectedAuth | FailureClass::RateLimited => {
                        constraints.exclude.insert(credential_id);
                    }
                    FailureClass::Transient if is_combo => break,
                    FailureClass::Transient => {}
                    FailureClass::Client if is_combo => break,
                    FailureClass::Client => {
                        let Some(failure) = target_failure else {
                            break;
                        };
                        return Err(GatewayError::UpstreamClient {
                            status: failure.status.unwrap_or(StatusCode::BAD_REQUEST),
                            code: failure.code,
                            message: failure.message,
                        });
                    }
                }
            }

            if let Some(failure) = target_failure {
                failures.push(TargetFailure {
                    target: target.to_string(),
                    message: failure.message.clone(),
                });
                last_failure = Some(failure);
            }
        }

        if is_combo {
            return Err(GatewayError::MappingFailureAllTargets(failures));
        }
        Err(match last_failure {
            Some(f) if f.class == FailureClass::RejectedAuth => {
                GatewayError::UpstreamRejected(f.message)
            }
            Some(f) => GatewayError::UpstreamTransient(f.message),
            None => GatewayError::NoCredentialAvailable,
        })
    }

    async fn call_target(
        &self,
        lease: &CredentialLease,
        body: &Value,
        stream: bool,
        settings: &GatewaySettings,
    ) -> Result<Dispatch, UpstreamCallError> {
        let started_at = Instant::now();
        let result = if stream {
            upstream::call_chat_completions_stream(
                &self.http,
                &self.base_url,
                lease.credential(),
                body,
                settings.request_timeout_ms,
            )
            .await
            .map(Dispatch::Streaming)
        } else {
            upstream::call_chat_completions(
                &self.http,
                &self.base_url,
                lease.credential(),
                body,
                settings.request_timeout_ms,
            )
            .await
            .map(Dispatch::Buffered)
        };
        metrics::histogram!("apollo_upstream_latency_seconds")
            .record(started_at.elapsed().as_secs_f64());
        let label = match &result {
            Ok(_) => "success",
            Err(err) => match err.class() {
                FailureClass::RejectedAuth => "rejected",
                FailureClass::RateLimited => "rate_limited",
                FailureClass::Transient => "transient",
                FailureClass::Client => "client_error",
            },
        };
        metrics::counter!("apollo_upstream_requests_total", "result" => label).increment(1);
        result
    }
}

const MIN_LEASE_RENEW_INTERVAL: Duration = Duration::from_millis(100);

fn build_upstream_body(body: &Value, target: &str, stream: bool) -> Value {
    let mut out = body.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("model".to_string(), Value::String(target.to_string()));
        obj.insert("stream".to_string(), Value::Bool(stream));
        if stream {
            obj.insert("stream_options".to_string(), json!({ "include_usage": true }));
        } else {
            obj.remove("stream_options");
        }
    }
    out
}

/// Relays upstream SSE chunks to `tx`, rewriting `model` to the name the
/// client asked for, until the upstream finishes, fails, or stays idle for
/// `idle_timeout`. Reading continues after the client goes away so the call
/// can still be accounted. The lease is renewed every third of `lease_ttl`;
/// losing it ends the relay.
pub async fn relay_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<Event>,
    lease: &CredentialLease,
    requested_model: &str,
    prompt_estimate: u64,
    idle_timeout: Duration,
    lease_ttl: Duration,
) -> StreamOutcome {
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = Utc::now().timestamp();
    let mut out_text = String::new();
    let mut upstream_usage: Option<Usage> = None;
    let mut outcome = StreamOutcome {
        usage: Usage::default(),
        estimated: false,
        completed: false,
        delivered: false,
        client_disconnected: false,
        error: None,
    };

    let renew_every = (lease_ttl / 3).max(MIN_LEASE_RENEW_INTERVAL);
    let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
    renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let mut stream = response.bytes_stream().eventsource();
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = renew.tick() => {
                match lease.renew(lease_ttl).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        outcome.error = Some(UpstreamCallError::new(
                            upstream::UpstreamErrorKind::Network,
                            None,
                            "credential lease lost mid-stream".to_string(),
                        ));
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            credential_id = %lease.credential_id(),
                            "failed to renew stream lease: {err}"
                        );
                        continue;
                    }
                }
            }
            _ = &mut idle => {
                outcome.error = Some(UpstreamCallError::timeout(format!(
                    "upstream stream idle for {}ms",
                    idle_timeout.as_millis()
                )));
                break;
            }
        };
        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
        let ev = match next {
            None => {
                outcome.completed = true;
                break;
            }
            Some(Err(err)) => {
                outcome.error = Some(UpstreamCallError::new(
                    upstream::UpstreamErrorKind::Network,
                    None,
                    err.to_string(),
                ));
                break;
            }
            Some(Ok(ev)) => ev,
        };
        if ev.data.trim() == "[DONE]" {
            outcome.completed = true;
            break;
        }

        let Ok(mut chunk) = serde_json::from_str::<Value>(&ev.data) else {
            continue;
        };
        if let Some(usage) = tokens::parse_usage(&chunk) {
            if upstream_usage.is_none_or(|u| usage.total() >= u.total()) {
                upstream_usage = Some(usage);
            }
        }
        let text = tokens::delta_text(&chunk);
        if !text.is_empty() {
            out_text.push_str(&text);
            outcome.delivered = true;
        }
        if let Some(obj) = chunk.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(requested_model.to_string()),
            );
            obj.entry("id").or_insert_with(|| Value::String(id.clone()));
            obj.entry("object")
                .or_insert_with(|| Value::String("chat.completion.chunk".to_string()));
            obj.entry("created")
                .or_insert_with(|| Value::Number(created.into()));
        }
        send_event(&tx, Event::default().data(chunk.to_string()), &mut outcome).await;
    }

    let (usage, estimated) = match upstream_usage {
        Some(usage) if outcome.error.is_none() => (usage, false),
        // Partial stream: charge only what was delivered.
        _ => (
            Usage {
                prompt_tokens: prompt_estimate,
                completion_tokens: tokens::estimate_text_tokens(&out_text),
            },
            true,
        ),
    };
    outcome.usage = usage;
    outcome.estimated = estimated;

    if let Some(err) = &outcome.error {
        let payload = json!({
            "error": {
                "message": err.message,
                "type": "server_error",
                "code": "upstream_stream_interrupted",
                "param": Value::Null,
            }
        });
        send_event(&tx, Event::default().data(payload.to_string()), &mut outcome).await;
    } else if estimated {
        let chunk = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": requested_model,
            "choices": [],
            "usage": usage.to_json(),
        });
        send_event(&tx, Event::default().data(chunk.to_string()), &mut outcome).await;
    }
    send_event(&tx, Event::default().data("[DONE]"), &mut outcome).await;
    outcome
}

async fn send_event(tx: &mpsc::Sender<Event>, event: Event, outcome: &mut StreamOutcome) {
    if outcome.client_disconnected {
        return;
    }
    if tx.send(event).await.is_err() {
        outcome.client_disconnected = true;
    }
}
