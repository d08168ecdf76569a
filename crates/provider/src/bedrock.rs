//! Bedrock-family adapter
//!
//! The model identifier moves from the body into the URL path
//! (`/model/{id}/invoke` or `/model/{id}/invoke-with-response-stream`), the
//! body carries the Bedrock `anthropic_version` token instead of `model`
//! and `stream` fields, and every request is signed per-request with the
//! credential's AWS key pair. Streamed responses arrive in the binary
//! event-stream framing and are re-emitted as SSE by the decoder.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use credential_pool::{CredentialMaterial, CredentialRecord};
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::anthropic::{serialize_body, supports};
use crate::descriptor::ProviderDescriptor;
use crate::eventstream::EventStreamDecoder;
use crate::model_map::ModelMap;
use crate::sigv4::{self, SigningParams};
use crate::{
    Capabilities, Error, ProviderAdapter, Result, StreamDecoder, TransformedRequest,
    UpstreamRequest,
};

/// Version token Bedrock expects inside the request body.
const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

pub struct BedrockAdapter {
    display_name: String,
    base_url: String,
    models: Vec<String>,
    map: ModelMap,
}

impl BedrockAdapter {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        Self {
            display_name: descriptor.id.clone(),
            base_url: descriptor.base_url_trimmed().to_string(),
            models: descriptor.models.clone(),
            map: ModelMap::new(&descriptor.model_mapping),
        }
    }
}

impl ProviderAdapter for BedrockAdapter {
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
            binary_event_stream: true,
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
        // AWS authenticates via SigV4; anthropic-* headers would change the
        // signature surface without being honored, so only content-type
        // travels.
        let mut headers = HeaderMap::new();
        if let Some(content_type) = client_headers.get(reqwest::header::CONTENT_TYPE) {
            headers.insert(reqwest::header::CONTENT_TYPE, content_type.clone());
        }
        headers
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
            obj.remove("stream");
            obj.insert(
                "anthropic_version".to_string(),
                Value::String(BEDROCK_ANTHROPIC_VERSION.to_string()),
            );
        }

        let action = if streaming {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        let url = format!(
            "{}/model/{}/{action}",
            self.base_url,
            sigv4::uri_encode_segment(&mapped)
        );
        Ok(TransformedRequest {
            body: serialize_body(&body)?,
            url,
        })
    }

    fn authenticate<'a>(
        &'a self,
        request: &'a mut UpstreamRequest,
        credential: &'a CredentialRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let CredentialMaterial::AwsSigV4 {
                access_key_id,
                secret_access_key,
                region,
            } = &credential.material
            else {
                return Err(Error::Credential(format!(
                    "credential {} has no AWS signing material",
                    credential.id
                )));
            };
            sigv4::sign(
                "POST",
                &request.url,
                &mut request.headers,
                &request.body,
                &SigningParams {
                    access_key_id,
                    secret_access_key: secret_access_key.expose(),
                    region,
                    service: "bedrock",
                },
                Utc::now(),
            )
        })
    }

    fn stream_decoder(&self) -> Option<Box<dyn StreamDecoder>> {
        Some(Box::new(EventStreamDecoder::new()))
    }
}
