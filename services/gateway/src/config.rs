//! Configuration types and loading
//!
//! TOML file resolved from `--config`, then the `GATEWAY_CONFIG`
//! environment variable, then `./gateway.toml`. Provider entries become
//! immutable descriptors at registry build time; editing the file while
//! running swaps the whole provider set (the watcher task polls the file's
//! mtime).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use common::SecretString;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub signature_cache: SignatureCacheConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// HTTP server settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_failover_timeout_secs")]
    pub failover_timeout_secs: u64,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_reload_poll_secs")]
    pub reload_poll_secs: u64,
}

/// Inbound authentication settings. With no keys configured and bearer
/// passthrough off, the listener is open (local deployments).
#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Vec<SecretString>,
    /// Accept any `authorization: bearer ...` and forward it transparently
    /// to adapters that declare transparent-auth support.
    #[serde(default)]
    pub allow_bearer: bool,
}

impl AuthConfig {
    pub fn required(&self) -> bool {
        !self.api_keys.is_empty() || self.allow_bearer
    }
}

/// Routing settings
#[derive(Debug, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub default_provider: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            default_provider: None,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration_secs(),
            half_open_probes: default_half_open_probes(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

/// Thinking-signature cache settings
#[derive(Debug, Deserialize)]
pub struct SignatureCacheConfig {
    #[serde(default = "default_signature_capacity")]
    pub capacity: u64,
    #[serde(default = "default_signature_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for SignatureCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_signature_capacity(),
            ttl_secs: default_signature_ttl_secs(),
        }
    }
}

/// One upstream provider
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub variant: provider::Variant,
    pub base_url: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub transparent_auth: bool,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

/// One credential. Exactly one material field must be set: `api_key`,
/// `bearer_token`, the AWS pair, or the OAuth pair.
#[derive(Debug, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub bearer_token: Option<SecretString>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<SecretString>,
    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub oauth_refresh_token: Option<SecretString>,
    #[serde(default)]
    pub oauth_token_url: Option<String>,
    /// Requests per minute; 0 means unlimited.
    #[serde(default)]
    pub rpm: i64,
    /// Tokens per minute; 0 means unlimited.
    #[serde(default)]
    pub tpm: i64,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_failover_timeout_secs() -> u64 {
    30
}

fn default_upstream_timeout_secs() -> u64 {
    600
}

fn default_reload_poll_secs() -> u64 {
    10
}

fn default_strategy() -> String {
    "failover".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_secs() -> u64 {
    30
}

fn default_half_open_probes() -> u32 {
    3
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_signature_capacity() -> u64 {
    10_000
}

fn default_signature_ttl_secs() -> u64 {
    3 * 60 * 60
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Resolve the config path: CLI flag, environment, then the default.
    pub fn resolve_path(cli_value: Option<&str>) -> PathBuf {
        if let Some(path) = cli_value {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("gateway.toml")
    }

    /// Load and parse configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| common::Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if router::Strategy::from_name(&self.router.strategy).is_none() {
            return Err(common::Error::Config(format!(
                "unknown routing strategy '{}'",
                self.router.strategy
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(&provider.id) {
                return Err(common::Error::Provider {
                    provider_id: provider.id.clone(),
                    reason: "duplicate provider id".to_string(),
                });
            }
            for credential in &provider.credentials {
                credential
                    .material_kind()
                    .map_err(|reason| common::Error::Credential {
                        provider_id: provider.id.clone(),
                        credential_id: credential.id.clone(),
                        reason,
                    })?;
            }
        }
        if let Some(default) = &self.router.default_provider
            && !self.providers.iter().any(|p| &p.id == default)
        {
            return Err(common::Error::Config(format!(
                "default_provider '{default}' is not a configured provider"
            )));
        }
        Ok(())
    }
}

impl CredentialConfig {
    /// Which material this credential carries; errors when none or more
    /// than one is configured.
    pub fn material_kind(&self) -> std::result::Result<&'static str, String> {
        let mut kinds = Vec::new();
        if self.api_key.is_some() {
            kinds.push("api_key");
        }
        if self.bearer_token.is_some() {
            kinds.push("bearer_token");
        }
        if self.aws_access_key_id.is_some()
            || self.aws_secret_access_key.is_some()
            || self.aws_region.is_some()
        {
            if self.aws_access_key_id.is_none()
                || self.aws_secret_access_key.is_none()
                || self.aws_region.is_none()
            {
                return Err(
                    "aws credentials need aws_access_key_id, aws_secret_access_key and aws_region"
                        .to_string(),
                );
            }
            kinds.push("aws");
        }
        if self.oauth_refresh_token.is_some() || self.oauth_token_url.is_some() {
            if self.oauth_refresh_token.is_none() || self.oauth_token_url.is_none() {
                return Err(
                    "oauth credentials need oauth_refresh_token and oauth_token_url".to_string(),
                );
            }
            kinds.push("oauth");
        }
        match kinds.as_slice() {
            [one] => Ok(one),
            [] => Err("no credential material configured".to_string()),
            many => Err(format!("conflicting credential material: {}", many.join(", "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
[server]
listen_addr = "127.0.0.1:8080"
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let file = write_config(MINIMAL);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.router.strategy, "failover");
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.open_duration_secs, 30);
        assert_eq!(config.signature_cache.ttl_secs, 10_800);
        assert!(config.providers.is_empty());
        assert!(!config.auth.required());
    }

    #[test]
    fn full_provider_entry_parses() {
        let file = write_config(
            r#"
[server]
listen_addr = "0.0.0.0:9000"
failover_timeout_secs = 10

[auth]
api_keys = ["gw-key-1"]
allow_bearer = true

[router]
strategy = "model_based"
default_provider = "main"

[[providers]]
id = "main"
variant = "anthropic"
base_url = "https://api.anthropic.com"
models = ["claude-sonnet-4-20250514"]
priority = 2

[providers.model_mapping]
"claude-" = "claude-sonnet-4-20250514"

[[providers.credentials]]
id = "k1"
api_key = "sk-ant-xxx"
rpm = 60
tpm = 30000
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert!(config.auth.required());
        assert_eq!(config.providers.len(), 1);
        let p = &config.providers[0];
        assert_eq!(p.variant, provider::Variant::Anthropic);
        assert_eq!(p.credentials[0].rpm, 60);
        assert_eq!(p.credentials[0].material_kind().unwrap(), "api_key");
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let file = write_config(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[router]
strategy = "coin_flip"
"#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn duplicate_provider_ids_are_rejected() {
        let file = write_config(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[[providers]]
id = "a"
variant = "anthropic"
base_url = "https://x"

[[providers]]
id = "a"
variant = "ollama"
base_url = "https://y"
"#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn credential_with_no_material_is_rejected() {
        let file = write_config(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[[providers]]
id = "a"
variant = "anthropic"
base_url = "https://x"

[[providers.credentials]]
id = "k1"
rpm = 60
"#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn partial_aws_material_is_rejected() {
        let config = CredentialConfig {
            id: "k".into(),
            api_key: None,
            bearer_token: None,
            aws_access_key_id: Some("AKID".into()),
            aws_secret_access_key: None,
            aws_region: None,
            oauth_refresh_token: None,
            oauth_token_url: None,
            rpm: 0,
            tpm: 0,
            priority: 0,
            weight: 1,
        };
        assert!(config.material_kind().is_err());
    }

    #[test]
    fn missing_default_provider_is_rejected() {
        let file = write_config(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[router]
strategy = "model_based"
default_provider = "ghost"
"#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn resolve_path_prefers_cli() {
        assert_eq!(
            Config::resolve_path(Some("/etc/gateway.toml")),
            PathBuf::from("/etc/gateway.toml")
        );
    }
}
