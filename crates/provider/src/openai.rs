//! OpenAI-shaped Claude adapter
//!
//! For gateways that expose Claude models behind an OpenAI-style deployment:
//! the body still speaks the Messages wire format and passes through
//! unchanged, but the credential travels as a bearer token.

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

pub struct OpenAiClaudeAdapter {
    display_name: String,
    base_url: String,
    models: Vec<String>,
    map: ModelMap,
    transparent_auth: bool,
}

impl OpenAiClaudeAdapter {
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

impl ProviderAdapter for OpenAiClaudeAdapter {
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
            body["model"] = Value::String(self.map_model(model));
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
            let token = match &credential.material {
                CredentialMaterial::Bearer(token) => token,
                CredentialMaterial::ApiKey(key) => key,
                _ => {
                    return Err(Error::Credential(format!(
                        "credential {} cannot be sent as a bearer token",
                        credential.id
                    )));
                }
            };
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|_| Error::Credential("token contains invalid bytes".into()))?;
            request.headers.insert(reqwest::header::AUTHORIZATION, value);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SecretString;
    use std::collections::HashMap;

    fn adapter() -> OpenAiClaudeAdapter {
        OpenAiClaudeAdapter::new(&ProviderDescriptor {
            id: "shaped".into(),
            variant: crate::Variant::OpenAiClaude,
            base_url: "https://gw.example.com/".into(),
            models: vec![],
            model_mapping: HashMap::from([(
                "claude-".to_string(),
                "claude-proxy-default".to_string(),
            )]),
            priority: 0,
            weight: 1,
            enabled: true,
            transparent_auth: true,
        })
    }

    #[tokio::test]
    async fn injects_bearer_token() {
        let a = adapter();
        let mut request = UpstreamRequest {
            url: String::new(),
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
        };
        let credential = CredentialRecord::new(
            "b",
            CredentialMaterial::Bearer(SecretString::new("tok-123")),
            0,
            0,
            0,
            1,
        );
        a.authenticate(&mut request, &credential).await.unwrap();
        assert_eq!(
            request.headers.get("authorization").unwrap(),
            "Bearer tok-123"
        );
    }

    #[tokio::test]
    async fn api_key_material_is_accepted_as_bearer() {
        let a = adapter();
        let mut request = UpstreamRequest {
            url: String::new(),
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
        };
        let credential = CredentialRecord::new(
            "k",
            CredentialMaterial::ApiKey(SecretString::new("sk-x")),
            0,
            0,
            0,
            1,
        );
        a.authenticate(&mut request, &credential).await.unwrap();
        assert_eq!(request.headers.get("authorization").unwrap(), "Bearer sk-x");
    }

    #[test]
    fn transparent_auth_capability_follows_descriptor() {
        assert!(adapter().capabilities().transparent_auth);
    }

    #[test]
    fn model_is_mapped_in_body() {
        let a = adapter();
        let body = serde_json::json!({"model": "claude-sonnet-4"});
        let transformed = a.transform_request(&body, "/v1/messages", false).unwrap();
        let out: Value = serde_json::from_slice(&transformed.body).unwrap();
        assert_eq!(out["model"], "claude-proxy-default");
        assert_eq!(transformed.url, "https://gw.example.com/v1/messages");
    }
}
