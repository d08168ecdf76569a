//! Anthropic-native adapter
//!
//! Pass-through variant: the body is forwarded unchanged and the target URL
//! mirrors the client path against the configured base URL. The credential
//! is injected as `x-api-key`, with `anthropic-version` supplied when the
//! client did not send one.

use std::future::Future;
use std::pin::Pin;

use credential_pool::{CredentialMaterial, CredentialRecord};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::descriptor::ProviderDescriptor;
use crate::headers::forward_default;
use crate::model_map::ModelMap;
use crate::{Capabilities, Error, ProviderAdapter, Result, TransformedRequest, UpstreamRequest};

/// Default Anthropic API version installed when the client omits it.
pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    display_name: String,
    base_url: String,
    models: Vec<String>,
    map: ModelMap,
    transparent_auth: bool,
}

impl AnthropicAdapter {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        Self {
            display_name: descriptor.id.clone(),
            base_url: descriptor.base_url_trimmed().to_string(),
            models: descriptor.models.clone(),
            map: ModelMap::new(&descriptor.model_mapping),
            transparent_auth: descriptor.transparent_auth,
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            transparent_auth: self.transparent_auth,
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
        path: &str,
        _streaming: bool,
    ) -> Result<TransformedRequest> {
        let mut body = body.clone();
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            let mapped = self.map_model(model);
            body["model"] = Value::String(mapped);
        }
        Ok(TransformedRequest {
            body: serialize_body(&body)?,
            url: format!("{}{}", self.base_url, path),
        })
    }

    fn authenticate<'a>(
        &'a self,
        request: &'a mut UpstreamRequest,
        credential: &'a CredentialRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let CredentialMaterial::ApiKey(key) = &credential.material else {
                return Err(Error::Credential(format!(
                    "credential {} is not an api key",
                    credential.id
                )));
            };
            let value = HeaderValue::from_str(key.expose())
                .map_err(|_| Error::Credential("api key contains invalid bytes".into()))?;
            request.headers.insert(HeaderName::from_static("x-api-key"), value);
            ensure_version_header(&mut request.headers);
            Ok(())
        })
    }
}

/// Shared model-support rule: a mapping hit or a declared model wins; a
/// provider that declares neither serves anything.
pub(crate) fn supports(map: &ModelMap, models: &[String], client_model: &str) -> bool {
    if map.lookup(client_model).is_some() {
        return true;
    }
    if models.iter().any(|m| m == client_model) {
        return true;
    }
    map.is_empty() && models.is_empty()
}

pub(crate) fn serialize_body(body: &Value) -> Result<bytes::Bytes> {
    serde_json::to_vec(body)
        .map(bytes::Bytes::from)
        .map_err(|e| Error::InvalidRequest(format!("body serialization failed: {e}")))
}

pub(crate) fn ensure_version_header(headers: &mut HeaderMap) {
    if !headers.contains_key("anthropic-version") {
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
    }
}
