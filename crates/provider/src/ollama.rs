//! Ollama-style adapter
//!
//! Local backends that speak the Messages wire format but lack hosted-only
//! features. The body passes through after stripping what the backend
//! cannot accept: `cache_control` markers (prompt caching) and document
//! (PDF) content blocks. Authentication is a bearer token when configured;
//! local deployments usually run with an empty credential.

use std::future::Future;
use std::pin::Pin;

use credential_pool::{CredentialMaterial, CredentialRecord};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::anthropic::{serialize_body, supports};
use crate::descriptor::ProviderDescriptor;
use crate::headers::forward_default;
use crate::model_map::ModelMap;
use crate::{Capabilities, Error, ProviderAdapter, Result, TransformedRequest, UpstreamRequest};

pub struct OllamaAdapter {
    display_name: String,
    base_url: String,
    models: Vec<String>,
    map: ModelMap,
}

impl OllamaAdapter {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        Self {
            display_name: descriptor.id.clone(),
            base_url: descriptor.base_url_trimmed().to_string(),
            models: descriptor.models.clone(),
            map: ModelMap::new(&descriptor.model_mapping),
        }
    }
}

impl ProviderAdapter for OllamaAdapter {
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
            body["model"] = Value::String(self.map_model(model));
        }
        strip_unsupported(&mut body);
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
            match &credential.material {
                CredentialMaterial::Bearer(token) | CredentialMaterial::ApiKey(token) => {
                    if !token.is_empty() {
                        let value =
                            HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                                .map_err(|_| {
                                    Error::Credential("token contains invalid bytes".into())
                                })?;
                        request.headers.insert(reqwest::header::AUTHORIZATION, value);
                    }
                    Ok(())
                }
                _ => Err(Error::Credential(format!(
                    "credential {} is not usable for a local backend",
                    credential.id
                ))),
            }
        })
    }
}

/// Remove request features hosted backends support but local ones reject:
/// `cache_control` on any content block or system entry, and document
/// content blocks (PDF input).
fn strip_unsupported(body: &mut Value) {
    if let Some(system) = body.get_mut("system") {
        strip_from_blocks(system);
    }
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages {
            if let Some(content) = message.get_mut("content") {
                strip_from_blocks(content);
            }
        }
    }
}

fn strip_from_blocks(content: &mut Value) {
    let Some(blocks) = content.as_array_mut() else {
        return;
    };
    blocks.retain(|block| block.get("type").and_then(Value::as_str) != Some("document"));
    for block in blocks {
        if let Some(obj) = block.as_object_mut() {
            obj.remove("cache_control");
        }
    }
}
