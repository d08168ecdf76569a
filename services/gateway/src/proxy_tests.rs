//! End-to-end tests against a stub upstream
//!
//! Each test boots the full axum app on an ephemeral port with a wiremock
//! upstream behind it, then drives real HTTP through the proxy.

use std::io::Write;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::Config;
use crate::state::AppState;

async fn start_gateway(config_toml: &str) -> String {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config_toml.as_bytes()).unwrap();
    let config = Config::load(file.path()).unwrap();

    let strategy = router::Strategy::from_name(&config.router.strategy).unwrap();
    let breaker = health::BreakerConfig {
        failure_threshold: config.breaker.failure_threshold,
        open_duration: Duration::from_secs(config.breaker.open_duration_secs),
        half_open_probes: config.breaker.half_open_probes,
    };
    let fleet = crate::registry::build_registry(&config).unwrap();
    let state = AppState::new(
        config,
        fleet,
        router::Router::new(strategy),
        health::HealthTracker::new(breaker),
        None,
    );
    let app = crate::app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn single_provider_config(upstream: &str, rpm: i64, tpm: i64) -> String {
    format!(
        r#"
[server]
listen_addr = "127.0.0.1:0"

[router]
strategy = "round_robin"

[[providers]]
id = "a"
variant = "anthropic"
base_url = "{upstream}"
models = ["m-x"]

[[providers.credentials]]
id = "k1"
api_key = "sk-a"
rpm = {rpm}
tpm = {tpm}
"#
    )
}

fn sse_event(name: &str, data: &Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

fn happy_sse() -> String {
    let mut s = String::new();
    s.push_str(&sse_event(
        "message_start",
        &json!({"type": "message_start", "message": {"id": "msg_1", "model": "m-x", "usage": {"input_tokens": 0}}}),
    ));
    s.push_str(&sse_event(
        "content_block_start",
        &json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ));
    s.push_str(&sse_event(
        "content_block_delta",
        &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "he"}}),
    ));
    s.push_str(&sse_event(
        "content_block_delta",
        &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "llo"}}),
    ));
    s.push_str(&sse_event(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": 0}),
    ));
    s.push_str(&sse_event(
        "message_delta",
        &json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
    ));
    s.push_str(&sse_event("message_stop", &json!({"type": "message_stop"})));
    s
}

async fn provider_summary(base: &str) -> Value {
    reqwest::get(format!("{base}/v1/providers"))
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap()
}

#[tokio::test]
async fn happy_path_streaming_is_byte_exact() {
    let upstream = MockServer::start().await;
    let sse = happy_sse();
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse.clone(), "text/event-stream"))
        .mount(&upstream)
        .await;

    let base = start_gateway(&single_provider_config(&upstream.uri(), 60, 30_000)).await;
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "m-x", "stream": true, "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let body = response.bytes().await.unwrap();
    assert_eq!(body, sse.as_bytes());

    // Give the server side a beat to run the stream finalizer.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let summary = provider_summary(&base).await;
    let provider = &summary["providers"][0];
    assert_eq!(provider["health"]["consecutive_failures"], 0);
    assert_eq!(provider["health"]["state"], "closed");
    let credential = &provider["credentials"][0];
    assert_eq!(credential["in_flight"], 0);
    assert_eq!(credential["rpm_remaining"], 59);
    // Reservation reconciled to the reported usage (2 output tokens); only
    // refill drift separates the remainder from capacity.
    let tpm = credential["tpm_remaining"].as_u64().unwrap();
    assert!((29_990..=30_000).contains(&tpm), "tpm_remaining = {tpm}");
}

#[tokio::test]
async fn failover_moves_to_lower_priority_provider_on_500() {
    let upstream_a = MockServer::start().await;
    let upstream_b = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&upstream_a)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"id": "msg_b", "model": "m-x", "usage": {"input_tokens": 3, "output_tokens": 5}}),
        ))
        .mount(&upstream_b)
        .await;

    let config = format!(
        r#"
[server]
listen_addr = "127.0.0.1:0"

[router]
strategy = "failover"

[[providers]]
id = "a"
variant = "anthropic"
base_url = "{a}"
models = ["m-x"]
priority = 2

[[providers.credentials]]
id = "a-k"
api_key = "sk-a"
rpm = 60

[[providers]]
id = "b"
variant = "anthropic"
base_url = "{b}"
models = ["m-x"]
priority = 1

[[providers.credentials]]
id = "b-k"
api_key = "sk-b"
rpm = 60
"#,
        a = upstream_a.uri(),
        b = upstream_b.uri(),
    );

    let base = start_gateway(&config).await;
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "m-x", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], "msg_b");

    let summary = provider_summary(&base).await;
    let a = summary["providers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["id"] == "a")
        .unwrap()
        .clone();
    assert_eq!(a["health"]["consecutive_failures"], 1);
    assert_eq!(a["health"]["state"], "closed");
}

#[tokio::test]
async fn second_credential_serves_when_first_is_rate_limited() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-api-key", "sk-k1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg_1"})))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(header("x-api-key", "sk-k2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg_2"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let config = format!(
        r#"
[server]
listen_addr = "127.0.0.1:0"

[router]
strategy = "round_robin"

[[providers]]
id = "a"
variant = "anthropic"
base_url = "{u}"
models = ["m-x"]

[[providers.credentials]]
id = "k1"
api_key = "sk-k1"
rpm = 1

[[providers.credentials]]
id = "k2"
api_key = "sk-k2"
rpm = 60
"#,
        u = upstream.uri(),
    );

    let base = start_gateway(&config).await;
    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .post(format!("{base}/v1/messages"))
            .json(&json!({"model": "m-x", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let summary = provider_summary(&base).await;
    assert_eq!(summary["providers"][0]["health"]["consecutive_failures"], 0);
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_sheds_requests() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&upstream)
        .await;

    let config = format!(
        r#"
[server]
listen_addr = "127.0.0.1:0"

[router]
strategy = "round_robin"

[breaker]
failure_threshold = 2
open_duration_secs = 60

[[providers]]
id = "a"
variant = "anthropic"
base_url = "{u}"
models = ["m-x"]

[[providers.credentials]]
id = "k"
api_key = "sk-a"
rpm = 60
"#,
        u = upstream.uri(),
    );

    let base = start_gateway(&config).await;
    let client = reqwest::Client::new();
    let request = json!({"model": "m-x", "messages": []});

    // Two upstream failures pass through with the upstream status.
    for _ in 0..2 {
        let response = client
            .post(format!("{base}/v1/messages"))
            .json(&request)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
    }

    // Circuit is now open: the third request never reaches the backend.
    let response = client
        .post(format!("{base}/v1/messages"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "overloaded_error");

    let summary = provider_summary(&base).await;
    assert_eq!(summary["providers"][0]["health"]["state"], "open");
}

#[tokio::test]
async fn thinking_signature_is_cached_reused_and_stripped() {
    let upstream = MockServer::start().await;

    let mut thinking_sse = String::new();
    thinking_sse.push_str(&sse_event(
        "message_start",
        &json!({"type": "message_start", "message": {"id": "msg_1", "model": "claude-x", "usage": {"input_tokens": 4}}}),
    ));
    thinking_sse.push_str(&sse_event(
        "content_block_start",
        &json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
    ));
    thinking_sse.push_str(&sse_event(
        "content_block_delta",
        &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "T"}}),
    ));
    thinking_sse.push_str(&sse_event(
        "content_block_delta",
        &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "sig-T"}}),
    ));
    thinking_sse.push_str(&sse_event(
        "content_block_stop",
        &json!({"type": "content_block_stop", "index": 0}),
    ));
    thinking_sse.push_str(&sse_event("message_stop", &json!({"type": "message_stop"})));

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(thinking_sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let config = format!(
        r#"
[server]
listen_addr = "127.0.0.1:0"

[router]
strategy = "round_robin"

[[providers]]
id = "a"
variant = "anthropic"
base_url = "{u}"
models = ["claude-x", "claude-y"]

[[providers.credentials]]
id = "k"
api_key = "sk-a"
rpm = 60
"#,
        u = upstream.uri(),
    );

    let base = start_gateway(&config).await;
    let client = reqwest::Client::new();

    // First request harvests the signature from the stream.
    let response = client
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "claude-x", "stream": true, "messages": [{"role": "user", "content": "q"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.bytes().await.unwrap();

    // Second request replays the same thinking text unsigned, under a
    // sibling claude model: the cached signature is attached.
    let replay = json!({
        "model": "claude-y",
        "messages": [
            {"role": "user", "content": "q"},
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "T"},
                {"type": "text", "text": "a"}
            ]},
            {"role": "user", "content": "next"}
        ]
    });
    client
        .post(format!("{base}/v1/messages"))
        .json(&replay)
        .send()
        .await
        .unwrap();

    // Third request carries different thinking text: stripped.
    let unknown = json!({
        "model": "claude-y",
        "messages": [
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "T-prime"},
                {"type": "text", "text": "a"}
            ]},
            {"role": "user", "content": "next"}
        ]
    });
    client
        .post(format!("{base}/v1/messages"))
        .json(&unknown)
        .send()
        .await
        .unwrap();

    let requests = upstream.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let block = &second["messages"][1]["content"][0];
    assert_eq!(block["type"], "thinking");
    assert_eq!(block["signature"], "sig-T");

    let third: Value = serde_json::from_slice(&requests[2].body).unwrap();
    let content = third["messages"][0]["content"].as_array().unwrap();
    assert!(content.iter().all(|b| b["type"] != "thinking"));
}

/// Binary event-stream frame in the upstream's framing: length-prefixed
/// prelude, string headers, `{"bytes": base64}` payload, zeroed CRCs.
fn binary_frame(inner_event: &Value) -> Vec<u8> {
    use base64::Engine;
    let payload = json!({
        "bytes": base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(inner_event).unwrap()),
    })
    .to_string();

    let mut header_block = Vec::new();
    for (name, value) in [(":message-type", "event"), (":event-type", "chunk")] {
        header_block.push(name.len() as u8);
        header_block.extend_from_slice(name.as_bytes());
        header_block.push(7u8);
        header_block.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_block.extend_from_slice(value.as_bytes());
    }
    let total = 12 + header_block.len() + payload.len() + 4;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&header_block);
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out
}

#[tokio::test]
async fn bedrock_event_stream_is_reemitted_as_sse() {
    let upstream = MockServer::start().await;
    let mut body = Vec::new();
    for event in [
        json!({"type": "message_start", "message": {"id": "msg_br", "model": "claude-sonnet-4"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "he"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "llo"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_stop"}),
    ] {
        body.extend_from_slice(&binary_frame(&event));
    }
    Mock::given(method("POST"))
        .and(path_regex(r"^/model/.+/invoke-with-response-stream$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body, "application/vnd.amazon.eventstream"),
        )
        .mount(&upstream)
        .await;

    let config = format!(
        r#"
[server]
listen_addr = "127.0.0.1:0"

[router]
strategy = "round_robin"

[[providers]]
id = "aws"
variant = "bedrock"
base_url = "{u}"
models = ["claude-sonnet-4"]

[providers.model_mapping]
"claude-sonnet-4" = "anthropic.claude-sonnet-4-v1:0"

[[providers.credentials]]
id = "sig"
aws_access_key_id = "AKIDEXAMPLE"
aws_secret_access_key = "secret"
aws_region = "us-west-2"
rpm = 60
"#,
        u = upstream.uri(),
    );

    let base = start_gateway(&config).await;
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "claude-sonnet-4", "stream": true, "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let text = String::from_utf8(response.bytes().await.unwrap().to_vec()).unwrap();
    let names: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("event: "))
        .map(|l| &l[7..])
        .collect();
    assert_eq!(
        names,
        [
            "message_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_stop"
        ]
    );

    let requests = upstream.received_requests().await.unwrap();
    let sent = &requests[0];
    assert!(sent.url.path().contains("anthropic.claude-sonnet-4-v1%3A0"));
    let authorization = sent.headers.get("authorization").unwrap().to_str().unwrap();
    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(sent.headers.get("x-amz-date").is_some());
    let body: Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
    assert!(body.get("model").is_none());
    assert!(body.get("stream").is_none());
}

#[tokio::test]
async fn missing_client_credentials_get_401_envelope() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg"})))
        .mount(&upstream)
        .await;

    let mut config = single_provider_config(&upstream.uri(), 60, 0);
    config.push_str("\n[auth]\napi_keys = [\"gw-key\"]\n");
    let base = start_gateway(&config).await;

    let client = reqwest::Client::new();
    let denied = client
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "m-x", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");

    let allowed = client
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", "gw-key")
        .json(&json!({"model": "m-x", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
}

#[tokio::test]
async fn oversized_body_is_rejected_with_envelope() {
    let upstream = MockServer::start().await;
    let mut config = single_provider_config(&upstream.uri(), 60, 0);
    config = config.replace(
        "[server]\nlisten_addr = \"127.0.0.1:0\"",
        "[server]\nlisten_addr = \"127.0.0.1:0\"\nmax_body_bytes = 256",
    );
    let base = start_gateway(&config).await;

    let huge = "x".repeat(4096);
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "m-x", "messages": [{"role": "user", "content": huge}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn unknown_model_gets_404_envelope() {
    let upstream = MockServer::start().await;
    let base = start_gateway(&single_provider_config(&upstream.uri(), 60, 0)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "mystery", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn models_endpoint_unions_declared_models() {
    let upstream = MockServer::start().await;
    let base = start_gateway(&single_provider_config(&upstream.uri(), 60, 0)).await;

    let body: Value = reqwest::get(format!("{base}/v1/models"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"][0]["id"], "m-x");
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let upstream = MockServer::start().await;
    let base = start_gateway(&single_provider_config(&upstream.uri(), 60, 0)).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-request-id").is_some());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
