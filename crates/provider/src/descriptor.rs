//! Provider descriptors
//!
//! A descriptor is the immutable, validated form of one `[[providers]]`
//! config entry. Hot reload never mutates a descriptor: the whole provider
//! set is rebuilt and swapped.

use std::collections::HashMap;

use serde::Deserialize;

/// Provider wire-format variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Anthropic,
    #[serde(rename = "openai_claude")]
    OpenAiClaude,
    Ollama,
    Bedrock,
    Azure,
    Vertex,
}

impl Variant {
    pub fn label(self) -> &'static str {
        match self {
            Variant::Anthropic => "anthropic",
            Variant::OpenAiClaude => "openai_claude",
            Variant::Ollama => "ollama",
            Variant::Bedrock => "bedrock",
            Variant::Azure => "azure",
            Variant::Vertex => "vertex",
        }
    }
}

/// Immutable description of one configured provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub variant: Variant,
    pub base_url: String,
    /// Client-facing model identifiers this provider serves.
    pub models: Vec<String>,
    /// Client-facing model prefix → backend model identifier.
    pub model_mapping: HashMap<String, String>,
    pub priority: u32,
    pub weight: u32,
    pub enabled: bool,
    /// Opt-in for forwarding the client's own credential unmodified.
    pub transparent_auth: bool,
}

impl ProviderDescriptor {
    /// Base URL with any trailing slash removed, so path concatenation is
    /// uniform.
    pub fn base_url_trimmed(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}
