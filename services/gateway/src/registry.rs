//! Registry construction and hot reload
//!
//! Builds the immutable provider snapshot from configuration and watches
//! the config file for edits. The watcher polls the file's mtime; on a
//! change it reloads, rebuilds the whole provider set, and swaps the
//! registry pointer. In-flight requests keep the snapshot they dispatched
//! against. Strategy and breaker settings are fixed at startup; only the
//! provider set follows the file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use credential_pool::{CredentialMaterial, CredentialPool, CredentialRecord};
use router::{ProviderHandle, Registry};
use tracing::{error, info, warn};

use crate::config::{Config, CredentialConfig, ProviderConfig};
use crate::state::AppState;

/// Build a fleet snapshot from configuration.
pub fn build_registry(config: &Config) -> common::Result<Registry> {
    let mut handles = Vec::with_capacity(config.providers.len());
    for provider_config in &config.providers {
        handles.push(Arc::new(build_provider(provider_config)?));
    }
    info!(providers = handles.len(), "registry built");
    Ok(Registry::new(
        handles,
        config.router.default_provider.clone(),
    ))
}

fn build_provider(config: &ProviderConfig) -> common::Result<ProviderHandle> {
    let descriptor = provider::ProviderDescriptor {
        id: config.id.clone(),
        variant: config.variant,
        base_url: config.base_url.clone(),
        models: config.models.clone(),
        model_mapping: config.model_mapping.clone(),
        priority: config.priority,
        weight: config.weight,
        enabled: config.enabled,
        transparent_auth: config.transparent_auth,
    };
    let adapter = provider::build_adapter(&descriptor);

    let mut credentials = Vec::with_capacity(config.credentials.len());
    for credential_config in &config.credentials {
        credentials.push(Arc::new(build_credential(&config.id, credential_config)?));
    }

    Ok(ProviderHandle {
        descriptor,
        adapter,
        credentials: CredentialPool::new(credentials),
    })
}

fn build_credential(
    provider_id: &str,
    config: &CredentialConfig,
) -> common::Result<CredentialRecord> {
    config
        .material_kind()
        .map_err(|reason| common::Error::Credential {
            provider_id: provider_id.to_string(),
            credential_id: config.id.clone(),
            reason,
        })?;
    let material = if let Some(key) = &config.api_key {
        CredentialMaterial::ApiKey(key.clone())
    } else if let Some(token) = &config.bearer_token {
        CredentialMaterial::Bearer(token.clone())
    } else if let (Some(access_key_id), Some(secret), Some(region)) = (
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        &config.aws_region,
    ) {
        CredentialMaterial::AwsSigV4 {
            access_key_id: access_key_id.clone(),
            secret_access_key: secret.clone(),
            region: region.clone(),
        }
    } else if let (Some(refresh_token), Some(token_url)) =
        (&config.oauth_refresh_token, &config.oauth_token_url)
    {
        CredentialMaterial::OAuthRefresh {
            refresh_token: refresh_token.clone(),
            token_url: token_url.clone(),
            cached: tokio::sync::Mutex::new(None),
        }
    } else {
        return Err(common::Error::Credential {
            provider_id: provider_id.to_string(),
            credential_id: config.id.clone(),
            reason: "no usable material".to_string(),
        });
    };
    Ok(CredentialRecord::new(
        config.id.clone(),
        material,
        config.rpm,
        config.tpm,
        config.priority,
        config.weight,
    ))
}

/// Spawn the config watcher: poll the file's mtime and rebuild on change.
pub fn spawn_reload_task(
    state: AppState,
    path: PathBuf,
    poll: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime = mtime(&path);
        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let current = mtime(&path);
            if current == last_mtime {
                continue;
            }
            last_mtime = current;
            info!(path = %path.display(), "config file changed, reloading providers");
            match Config::load(&path) {
                Ok(config) => match build_registry(&config) {
                    Ok(registry) => {
                        state.replace_registry(registry);
                        info!("provider set replaced");
                    }
                    Err(e) => error!(error = %e, "registry rebuild failed, keeping old set"),
                },
                Err(e) => warn!(error = %e, "config reload failed, keeping old set"),
            }
        }
    })
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Probe targets for every currently configured provider (re-evaluated by
/// the probe task each cycle so it follows reloads).
pub fn probe_targets(registry: &Registry) -> Vec<health::ProbeTarget> {
    registry
        .providers()
        .iter()
        .filter(|handle| handle.descriptor.enabled)
        .map(|handle| health::ProbeTarget {
            provider_id: handle.id().to_string(),
            url: format!("{}/v1/models", handle.descriptor.base_url_trimmed()),
        })
        .collect()
}
