//! Streaming proxy dispatch
//!
//! The `/v1/messages` handler reads the body once (bounded), derives the
//! request fingerprint, asks the router for candidates, and attempts the
//! primary provider. Under the failover strategy a failover-eligible error
//! triggers a parallel fan-out over the remaining candidates: the first
//! successful response wins and the rest are cancelled by dropping their
//! futures. Every attempt carries an `AttemptGuard` whose Drop performs the
//! exactly-once bookkeeping — in-flight decrement, TPM reconciliation, and
//! the health outcome — on every terminal path including client
//! cancellation mid-stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use credential_pool::CredentialRecord;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use health::{Admission, HealthRecord, Outcome};
use provider::{model_group, StreamDecoder, UpstreamRequest};
use router::{ProviderHandle, RequestFingerprint};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::bearer_credential;
use crate::error::{ApiError, ErrorClass};
use crate::estimate::estimate_cost;
use crate::metrics;
use crate::signature;
use crate::sse::SseScanner;
use crate::state::AppState;

/// Terminal outcome slot shared between the attempt and its stream.
#[derive(Clone)]
struct OutcomeCell(Arc<Mutex<Outcome>>);

impl OutcomeCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Outcome::Cancelled)))
    }

    fn set(&self, outcome: Outcome) {
        *self.0.lock().unwrap() = outcome;
    }

    fn get(&self) -> Outcome {
        *self.0.lock().unwrap()
    }
}

/// Exactly-once finalizer for one provider attempt.
struct AttemptGuard {
    credential: Option<Arc<CredentialRecord>>,
    health: Arc<HealthRecord>,
    probe: bool,
    estimated: u64,
    usage: Arc<AtomicU64>,
    outcome: OutcomeCell,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if let Some(credential) = &self.credential {
            credential.in_flight_dec();
            credential.reconcile(self.estimated, self.usage.load(Ordering::Relaxed));
        }
        self.health.record(self.outcome.get(), self.probe);
    }
}

/// Result of one provider attempt.
enum Attempt {
    /// Final: a success, or an error that must not be retried elsewhere.
    Served(Response),
    /// Failover-eligible failure. `rendered` is what the client gets when
    /// no further candidate exists.
    Failed { rendered: Response, message: String },
}

pub async fn messages(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let client_headers = parts.headers;

    let limit = state.config().server.max_body_bytes;
    let body_bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::payload_too_large(limit).into_response(),
    };
    let body_json: Value = match serde_json::from_slice(&body_bytes) {
        Ok(value) => value,
        Err(e) => return ApiError::bad_request(format!("invalid JSON body: {e}")).into_response(),
    };
    let Some(model) = body_json.get("model").and_then(Value::as_str).map(str::to_string) else {
        return ApiError::bad_request("request body is missing the model field").into_response();
    };
    let streaming = body_json
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let fingerprint = RequestFingerprint {
        model,
        has_signed_thinking: signature::has_signed_thinking(&body_json),
        estimated_cost: estimate_cost(&body_bytes),
    };

    let transparent = if state.config().auth.allow_bearer {
        bearer_credential(&client_headers)
    } else {
        None
    };

    let registry = state.registry();
    let candidates = match state
        .router()
        .candidates(&registry, state.tracker(), &fingerprint)
    {
        Ok(candidates) => candidates,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let started = Instant::now();
    let primary = Arc::clone(&candidates[0]);
    let first = attempt(
        &state,
        Arc::clone(&primary),
        &body_json,
        &client_headers,
        &fingerprint,
        streaming,
        transparent.as_deref(),
    )
    .await;

    let response = match first {
        Attempt::Served(response) => response,
        Attempt::Failed { rendered, message } => {
            if state.router().is_failover() && candidates.len() > 1 {
                metrics::record_failover(primary.id());
                warn!(provider_id = %primary.id(), error = %message, "primary failed, fanning out");
                fan_out(
                    &state,
                    &candidates[1..],
                    &body_json,
                    &client_headers,
                    &fingerprint,
                    streaming,
                    transparent.as_deref(),
                )
                .await
                .unwrap_or_else(|| {
                    ApiError::failover_exhausted(format!(
                        "all providers failed; last error: {message}"
                    ))
                    .into_response()
                })
            } else {
                rendered
            }
        }
    };
    metrics::record_duration(primary.id(), started.elapsed().as_secs_f64());
    response
}

/// Parallel fan-out: every remaining candidate is attempted concurrently,
/// the first success wins, and dropping the rest cancels them. The whole
/// aggregate is bounded by the failover timeout.
async fn fan_out(
    state: &AppState,
    rest: &[Arc<ProviderHandle>],
    body: &Value,
    client_headers: &axum::http::HeaderMap,
    fingerprint: &RequestFingerprint,
    streaming: bool,
    transparent: Option<&str>,
) -> Option<Response> {
    let timeout = Duration::from_secs(state.config().server.failover_timeout_secs);
    let mut attempts: FuturesUnordered<_> = rest
        .iter()
        .map(|handle| {
            attempt(
                state,
                Arc::clone(handle),
                body,
                client_headers,
                fingerprint,
                streaming,
                transparent,
            )
        })
        .collect();

    let winner = tokio::time::timeout(timeout, async {
        while let Some(result) = attempts.next().await {
            if let Attempt::Served(response) = result {
                return Some(response);
            }
        }
        None
    })
    .await;

    match winner {
        Ok(result) => result,
        Err(_) => {
            warn!("failover fan-out timed out");
            None
        }
    }
}

async fn attempt(
    state: &AppState,
    handle: Arc<ProviderHandle>,
    body: &Value,
    client_headers: &axum::http::HeaderMap,
    fingerprint: &RequestFingerprint,
    streaming: bool,
    transparent: Option<&str>,
) -> Attempt {
    let provider_id = handle.id().to_string();
    let record = state.tracker().record(&provider_id);

    let admission = record.try_admit();
    if admission == Admission::Reject {
        return Attempt::Failed {
            rendered: ApiError::no_eligible_provider(format!(
                "provider {provider_id} is unavailable"
            ))
            .into_response(),
            message: format!("{provider_id}: circuit open"),
        };
    }
    let probe = admission == Admission::Probe;

    let use_transparent = transparent.is_some() && handle.adapter.capabilities().transparent_auth;
    let credential = if use_transparent {
        None
    } else {
        match handle.credentials.select(fingerprint.estimated_cost) {
            Ok(credential) => Some(credential),
            Err(e) => {
                // Release the probe slot; a local rate limit says nothing
                // about the provider's health.
                record.record(Outcome::Cancelled, probe);
                return Attempt::Failed {
                    rendered: ApiError::rate_limited(e.to_string()).into_response(),
                    message: format!("{provider_id}: {e}"),
                };
            }
        }
    };
    if let Some(credential) = &credential {
        credential.in_flight_inc();
    }

    let usage = Arc::new(AtomicU64::new(0));
    let outcome = OutcomeCell::new();
    let guard = AttemptGuard {
        credential: credential.clone(),
        health: Arc::clone(&record),
        probe,
        estimated: fingerprint.estimated_cost,
        usage: Arc::clone(&usage),
        outcome: outcome.clone(),
    };

    // Sign or strip thinking blocks for the group of the model this
    // provider will actually run.
    let mut prepared = body.clone();
    let target_group = model_group(&handle.adapter.map_model(&fingerprint.model)).to_string();
    signature::prepare_thinking(&mut prepared, &target_group, state.signatures());

    let transformed = match handle
        .adapter
        .transform_request(&prepared, "/v1/messages", streaming)
    {
        Ok(transformed) => transformed,
        Err(e) => {
            if let Some(credential) = &credential {
                credential.refund_request_token();
            }
            return Attempt::Served(ApiError::bad_request(e.to_string()).into_response());
        }
    };

    let mut upstream = UpstreamRequest {
        url: transformed.url,
        headers: handle.adapter.forward_headers(client_headers),
        body: transformed.body,
    };
    if !upstream.headers.contains_key(reqwest::header::CONTENT_TYPE) {
        upstream.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    if use_transparent {
        if let Some(bearer) = transparent
            && let Ok(value) = HeaderValue::from_str(bearer)
        {
            upstream.headers.insert(reqwest::header::AUTHORIZATION, value);
        }
    } else if let Some(credential) = &credential
        && let Err(e) = handle.adapter.authenticate(&mut upstream, credential).await
    {
        credential.refund_request_token();
        outcome.set(Outcome::Failure);
        metrics::record_upstream_error(&provider_id, "auth");
        drop(guard);
        return Attempt::Failed {
            rendered: ApiError::internal(format!("authentication against {provider_id} failed"))
                .into_response(),
            message: format!("{provider_id}: {e}"),
        };
    }

    debug!(provider_id = %provider_id, url = %upstream.url, streaming, "dispatching upstream");
    let mut builder = state
        .http()
        .post(&upstream.url)
        .headers(upstream.headers)
        .body(upstream.body);
    if !streaming {
        builder = builder.timeout(Duration::from_secs(
            state.config().server.upstream_timeout_secs,
        ));
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            let (kind, status) = if e.is_timeout() {
                ("timeout", StatusCode::GATEWAY_TIMEOUT)
            } else {
                ("transport", StatusCode::BAD_GATEWAY)
            };
            outcome.set(Outcome::Failure);
            metrics::record_upstream_error(&provider_id, kind);
            drop(guard);
            return Attempt::Failed {
                rendered: ApiError {
                    status,
                    class: ErrorClass::Api,
                    message: format!("upstream request failed: {e}"),
                }
                .into_response(),
                message: format!("{provider_id}: {e}"),
            };
        }
    };

    let status = response.status().as_u16();
    if let Some(credential) = &credential {
        learn_limits(credential, response.headers());
    }

    if Outcome::from_status(status).failover_eligible() {
        outcome.set(Outcome::Failure);
        metrics::record_upstream_error(&provider_id, "status");
        let content_type = response.headers().get(reqwest::header::CONTENT_TYPE).cloned();
        let bytes = response.bytes().await.unwrap_or_default();
        drop(guard);
        let summary = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]).to_string();
        return Attempt::Failed {
            rendered: passthrough(status, content_type, bytes),
            message: format!("{provider_id} returned {status}: {summary}"),
        };
    }

    let is_sse = handle.adapter.capabilities().binary_event_stream
        || response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

    if response.status().is_success() && streaming && is_sse {
        metrics::record_request(&provider_id, status);
        return Attempt::Served(relay_sse(
            state,
            &handle,
            &fingerprint.model,
            response,
            guard,
            usage,
            outcome,
        ));
    }

    let success = response.status().is_success();
    let content_type = response.headers().get(reqwest::header::CONTENT_TYPE).cloned();
    match response.bytes().await {
        Ok(bytes) => {
            if success {
                if let Ok(parsed) = serde_json::from_slice::<Value>(&bytes) {
                    let input = parsed["usage"]["input_tokens"].as_u64().unwrap_or(0);
                    let output = parsed["usage"]["output_tokens"].as_u64().unwrap_or(0);
                    usage.store(input + output, Ordering::Relaxed);
                }
            }
            // Non-failure statuses (including other 4xx) count as health
            // successes: they are client-originated.
            outcome.set(Outcome::Success);
            drop(guard);
            metrics::record_request(&provider_id, status);
            Attempt::Served(passthrough(status, content_type, bytes))
        }
        Err(e) => {
            outcome.set(Outcome::Failure);
            metrics::record_upstream_error(&provider_id, "transport");
            drop(guard);
            Attempt::Failed {
                rendered: ApiError::failover_exhausted(format!("upstream body read failed: {e}"))
                    .into_response(),
                message: format!("{provider_id}: {e}"),
            }
        }
    }
}

/// Forward the upstream SSE stream to the client, sniffing signatures and
/// usage along the way. The guard travels inside the stream state so the
/// bookkeeping fires exactly once — on clean completion, upstream error, or
/// the client going away.
fn relay_sse(
    state: &AppState,
    handle: &Arc<ProviderHandle>,
    client_model: &str,
    response: reqwest::Response,
    guard: AttemptGuard,
    usage: Arc<AtomicU64>,
    outcome: OutcomeCell,
) -> Response {
    struct RelayState {
        upstream: futures_util::stream::BoxStream<'static, reqwest::Result<Bytes>>,
        decoder: Option<Box<dyn StreamDecoder>>,
        scanner: SseScanner,
        usage: Arc<AtomicU64>,
        outcome: OutcomeCell,
        finished: bool,
        _guard: AttemptGuard,
    }

    let relay = RelayState {
        upstream: response.bytes_stream().boxed(),
        decoder: handle.adapter.stream_decoder(),
        scanner: SseScanner::new(Arc::clone(state.signatures()), client_model),
        usage,
        outcome,
        finished: false,
        _guard: guard,
    };

    let stream = futures_util::stream::unfold(relay, |mut relay| async move {
        if relay.finished {
            return None;
        }
        match relay.upstream.next().await {
            Some(Ok(chunk)) => {
                let raw = match relay.decoder.as_mut() {
                    Some(decoder) => match decoder.feed(&chunk) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            warn!(error = %e, "stream decode failed, aborting relay");
                            relay.outcome.set(Outcome::Failure);
                            relay.finished = true;
                            return Some((Err(std::io::Error::other(e.to_string())), relay));
                        }
                    },
                    None => chunk,
                };
                let out = relay.scanner.feed(&raw);
                relay
                    .usage
                    .store(relay.scanner.usage_tokens(), Ordering::Relaxed);
                Some((Ok::<Bytes, std::io::Error>(out), relay))
            }
            Some(Err(e)) => {
                // Truncation stays visible: the connection is broken, no
                // synthetic terminator is emitted.
                warn!(error = %e, "upstream stream error mid-relay");
                relay.outcome.set(Outcome::Failure);
                relay.finished = true;
                Some((Err(std::io::Error::other(e.to_string())), relay))
            }
            None => {
                relay.finished = true;
                relay
                    .usage
                    .store(relay.scanner.usage_tokens(), Ordering::Relaxed);
                relay.outcome.set(if relay.scanner.complete() {
                    Outcome::Success
                } else {
                    Outcome::Failure
                });
                let tail = relay.scanner.finish();
                if tail.is_empty() {
                    None
                } else {
                    Some((Ok(tail), relay))
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache, no-transform")
        .header(axum::http::header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Pass an upstream response through unchanged: status, content type, body.
fn passthrough(status: u16, content_type: Option<HeaderValue>, body: Bytes) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(content_type) = content_type {
        builder = builder.header(axum::http::header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Apply limits reported by the upstream's rate-limit headers.
fn learn_limits(credential: &CredentialRecord, headers: &reqwest::header::HeaderMap) {
    let parse = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
    };
    let requests = parse("anthropic-ratelimit-requests-limit");
    let tokens = parse("anthropic-ratelimit-tokens-limit");
    if requests.is_some() || tokens.is_some() {
        credential.learn_limits(requests, tokens);
    }
}

// --- Supporting endpoints ---

pub async fn list_models(State(state): State<AppState>) -> Response {
    let registry = state.registry();
    let data: Vec<Value> = registry
        .all_models()
        .into_iter()
        .map(|id| serde_json::json!({"type": "model", "id": id}))
        .collect();
    axum::Json(serde_json::json!({"data": data, "has_more": false})).into_response()
}

pub async fn list_providers(State(state): State<AppState>) -> Response {
    let registry = state.registry();
    let health = state.tracker().summaries();
    let providers: Vec<Value> = registry
        .providers()
        .iter()
        .map(|handle| {
            serde_json::json!({
                "id": handle.id(),
                "variant": handle.descriptor.variant.label(),
                "enabled": handle.descriptor.enabled,
                "priority": handle.descriptor.priority,
                "weight": handle.descriptor.weight,
                "models": handle.adapter.list_models(),
                "health": health.get(handle.id()).cloned().unwrap_or_else(
                    || serde_json::json!({"state": "closed", "consecutive_failures": 0})
                ),
                "credentials": handle.credentials.usage(),
            })
        })
        .collect();
    axum::Json(serde_json::json!({"providers": providers})).into_response()
}

pub async fn health_endpoint() -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({"status": "ok"}).to_string(),
    )
        .into_response()
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics_handle() {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => ApiError::not_found("metrics recorder not installed").into_response(),
    }
}
