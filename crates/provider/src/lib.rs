//! Provider adapters for upstream LLM backends
//!
//! One adapter per provider variant. The adapter owns everything that is
//! specific to a backend's wire format: base URL and target-URL
//! construction, credential injection, which client headers pass through,
//! request-body rewriting, model-name mapping, and (for Bedrock) decoding
//! the binary event-stream response back into SSE.
//!
//! Adapters are used through `Arc<dyn ProviderAdapter>`, so async methods
//! use `Pin<Box<dyn Future>>` return types for dyn-compatibility.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod descriptor;
pub mod eventstream;
pub mod headers;
pub mod model_map;
pub mod ollama;
pub mod openai;
pub mod sigv4;
pub mod vertex;

pub use descriptor::{ProviderDescriptor, Variant};
pub use model_map::{model_group, ModelMap};

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use credential_pool::CredentialRecord;
use reqwest::header::HeaderMap;

/// What a provider variant can do, consulted by the router and handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Backend speaks SSE natively for streamed responses.
    pub streaming: bool,
    /// Adapter accepts transparent passthrough of the client's own
    /// credential (still gated by the deployment's auth policy).
    pub transparent_auth: bool,
    /// `transform_request` rewrites the body rather than passing it through.
    pub body_rewrite: bool,
    /// The target URL embeds the model rather than mirroring the client path.
    pub url_rewrite: bool,
    /// Streamed responses arrive in the binary event-stream framing and
    /// need `stream_decoder()` before they are SSE.
    pub binary_event_stream: bool,
}

/// A request body and the URL it should be sent to.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub body: Bytes,
    pub url: String,
}

/// The outbound request being assembled for the backend.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Errors from adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("credential mismatch: {0}")]
    Credential(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("stream decode error: {0}")]
    Decode(String),
}

/// Result alias for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Decodes a backend's native streaming format into SSE bytes.
///
/// Stateful: frames may straddle chunk boundaries, so the decoder keeps an
/// internal buffer between `feed` calls.
pub trait StreamDecoder: Send {
    /// Feed raw upstream bytes; returns zero or more complete SSE events.
    fn feed(&mut self, chunk: &[u8]) -> Result<Bytes>;
}

/// Abstraction over upstream provider wire formats.
pub trait ProviderAdapter: Send + Sync {
    /// Human-readable name for logs and the admin summary.
    fn display_name(&self) -> &str;

    /// Configured base URL.
    fn base_url(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Map a client-facing model identifier to the backend's identifier by
    /// longest-prefix match; unmapped models pass through unchanged.
    fn map_model(&self, client_model: &str) -> String;

    /// The client-facing model identifiers this provider serves.
    fn list_models(&self) -> Vec<String>;

    /// Whether the provider can serve the requested model.
    fn supports_model(&self, client_model: &str) -> bool;

    /// Select which client headers travel to the backend.
    fn forward_headers(&self, client_headers: &HeaderMap) -> HeaderMap;

    /// Rewrite the request body and produce the target URL.
    fn transform_request(
        &self,
        body: &serde_json::Value,
        path: &str,
        streaming: bool,
    ) -> Result<TransformedRequest>;

    /// Install the credential's material on the outbound request. Async
    /// because some variants fetch or refresh a token first.
    fn authenticate<'a>(
        &'a self,
        request: &'a mut UpstreamRequest,
        credential: &'a CredentialRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Decoder for backends whose stream is not already SSE.
    fn stream_decoder(&self) -> Option<Box<dyn StreamDecoder>> {
        None
    }
}

/// Build the adapter for a provider descriptor.
pub fn build_adapter(descriptor: &ProviderDescriptor) -> std::sync::Arc<dyn ProviderAdapter> {
    match descriptor.variant {
        Variant::Anthropic => std::sync::Arc::new(anthropic::AnthropicAdapter::new(descriptor)),
        Variant::OpenAiClaude => std::sync::Arc::new(openai::OpenAiClaudeAdapter::new(descriptor)),
        Variant::Ollama => std::sync::Arc::new(ollama::OllamaAdapter::new(descriptor)),
        Variant::Bedrock => std::sync::Arc::new(bedrock::BedrockAdapter::new(descriptor)),
        Variant::Azure => std::sync::Arc::new(azure::AzureAdapter::new(descriptor)),
        Variant::Vertex => std::sync::Arc::new(vertex::VertexAdapter::new(descriptor)),
    }
}
