//! Vertex-family adapter
//!
//! The model identifier moves into the URL path
//! (`/publishers/anthropic/models/{id}:streamRawPredict` or `:rawPredict`)
//! and the body carries the Vertex `anthropic_version` token. Credentials
//! are OAuth refresh tokens exchanged for short-lived access tokens against
//! the configured token endpoint; the current access token is cached on the
//! credential and refreshed inline when it is about to expire. A background
//! task can refresh proactively so the request path rarely pays the
//! exchange latency.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use credential_pool::{CachedToken, CredentialMaterial, CredentialRecord};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::anthropic::{serialize_body, supports};
use crate::descriptor::ProviderDescriptor;
use crate::headers::forward_default;
use crate::model_map::ModelMap;
use crate::{Capabilities, Error, ProviderAdapter, Result, TransformedRequest, UpstreamRequest};

/// Version token Vertex expects inside the request body.
const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

/// Refresh an access token this close to expiry.
const REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

/// Response from the OAuth token endpoint. `expires_in` is a delta in
/// seconds from the response time; the caller converts it to an absolute
/// unix millisecond timestamp before caching.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// Exchange a refresh token for a fresh access token.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await
        .map_err(|e| Error::Auth(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Auth(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Auth(format!("invalid token response: {e}")))
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Return a valid access token for the credential, refreshing inline if the
/// cached one expires within the threshold.
async fn access_token(client: &reqwest::Client, credential: &CredentialRecord) -> Result<String> {
    let CredentialMaterial::OAuthRefresh {
        refresh_token,
        token_url,
        cached,
    } = &credential.material
    else {
        return Err(Error::Credential(format!(
            "credential {} has no OAuth refresh material",
            credential.id
        )));
    };

    let mut cached = cached.lock().await;
    let threshold = now_millis() + REFRESH_THRESHOLD.as_millis() as u64;
    if let Some(token) = cached.as_ref()
        && token.expires_at_millis > threshold
    {
        return Ok(token.access_token.clone());
    }

    debug!(credential_id = %credential.id, "access token expiring, refreshing inline");
    let response = refresh_access_token(client, token_url, refresh_token.expose()).await?;
    let token = CachedToken {
        access_token: response.access_token,
        expires_at_millis: now_millis() + response.expires_in * 1000,
    };
    let access = token.access_token.clone();
    *cached = Some(token);
    info!(credential_id = %credential.id, "access token refreshed");
    Ok(access)
}

/// Spawn a proactive refresh loop over OAuth credentials so most requests
/// find a warm token. Failures are left for the request path to retry.
pub fn spawn_refresh_task(
    credentials: Vec<Arc<CredentialRecord>>,
    client: reqwest::Client,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; tokens are fetched lazily on the
        // first request anyway.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for credential in &credentials {
                if matches!(credential.material, CredentialMaterial::OAuthRefresh { .. }) {
                    if let Err(e) = access_token(&client, credential).await {
                        warn!(credential_id = %credential.id, error = %e, "background token refresh failed");
                    }
                }
            }
        }
    })
}

pub struct VertexAdapter {
    display_name: String,
    base_url: String,
    models: Vec<String>,
    map: ModelMap,
    client: reqwest::Client,
}

impl VertexAdapter {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        Self {
            display_name: descriptor.id.clone(),
            base_url: descriptor.base_url_trimmed().to_string(),
            models: descriptor.models.clone(),
            map: ModelMap::new(&descriptor.model_mapping),
            client: reqwest::Client::new(),
        }
    }
}

impl ProviderAdapter for VertexAdapter {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            body_rewrite: true,
            url_rewrite: true,
            ..Capabilities::default()
        }
    }

    fn map_model(&self, client_model: &str) -> String {
        self.map
            .lookup(client_model)
            .map(str::to_string)
            .unwrap_or_else(|| client_model.to_string())
    }

    fn list_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn supports_model(&self, client_model: &str) -> bool {
        supports(&self.map, &self.models, client_model)
    }

    fn forward_headers(&self, client_headers: &HeaderMap) -> HeaderMap {
        forward_default(client_headers)
    }

    fn transform_request(
        &self,
        body: &Value,
        _path: &str,
        streaming: bool,
    ) -> Result<TransformedRequest> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidRequest("request body has no model field".into()))?;
        let mapped = self.map_model(model);

        let mut body = body.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.remove("model");
            obj.insert(
                "anthropic_version".to_string(),
                Value::String(VERTEX_ANTHROPIC_VERSION.to_string()),
            );
        }

        let action = if streaming {
            "streamRawPredict"
        } else {
            "rawPredict"
        };
        Ok(TransformedRequest {
            body: serialize_body(&body)?,
            url: format!(
                "{}/publishers/anthropic/models/{mapped}:{action}",
                self.base_url
            ),
        })
    }

    fn authenticate<'a>(
        &'a self,
        request: &'a mut UpstreamRequest,
        credential: &'a CredentialRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let token = access_token(&self.client, credential).await?;
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::Credential("token contains invalid bytes".into()))?;
            request.headers.insert(reqwest::header::AUTHORIZATION, value);
            Ok(())
        })
    }
}
