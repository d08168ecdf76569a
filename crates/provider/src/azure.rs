//! Azure-family adapter
//!
//! The client-facing model maps to a deployment name embedded in the URL
//! path; the credential travels in the `api-key` header. The body passes
//! through with the mapped model so deployments that validate the field
//! see a consistent value.

use std::future::Future;
use std::pin::Pin;

use credential_pool::{CredentialMaterial, CredentialRecord};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::anthropic::{serialize_body, supports};
use crate::descriptor::ProviderDescriptor;
use crate::headers::forward_default;
use crate::model_map::ModelMap;
use crate::{Capabilities, Error, ProviderAdapter, Result, TransformedRequest, UpstreamRequest};

pub struct AzureAdapter {
    display_name: String,
    base_url: String,
    models: Vec<String>,
    map: ModelMap,
}

impl AzureAdapter {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        Self {
            display_name: descriptor.id.clone(),
            base_url: descriptor.base_url_trimmed().to_string(),
            models: descriptor.models.clone(),
            map: ModelMap::new(&descriptor.model_mapping),
        }
    }
}

impl ProviderAdapter for AzureAdapter {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
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
        path: &str,
        _streaming: bool,
    ) -> Result<TransformedRequest> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidRequest("request body has no model field".into()))?;
        let deployment = self.map_model(model);

        let mut body = body.clone();
        body["model"] = Value::String(deployment.clone());

        Ok(TransformedRequest {
            body: serialize_body(&body)?,
            url: format!("{}/deployments/{deployment}{path}", self.base_url),
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
            request.headers.insert(HeaderName::from_static("api-key"), value);
            Ok(())
        })
    }
}
