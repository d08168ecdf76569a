//! Fleet registry snapshots
//!
//! A `Registry` is an immutable snapshot of the configured providers. Hot
//! reload builds a fresh registry and swaps the shared pointer; requests
//! already dispatched keep the snapshot they read, so a reload never
//! mutates state under a live request.

use std::sync::Arc;

use credential_pool::CredentialPool;
use provider::{ProviderAdapter, ProviderDescriptor};

/// One provider: its immutable descriptor, wire-format adapter, and
/// credential pool.
pub struct ProviderHandle {
    pub descriptor: ProviderDescriptor,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub credentials: CredentialPool,
}

impl ProviderHandle {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("descriptor", &self.descriptor)
            .field("adapter", &self.adapter.display_name())
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// Immutable snapshot of the provider fleet.
pub struct Registry {
    providers: Vec<Arc<ProviderHandle>>,
    default_provider: Option<String>,
}

impl Registry {
    pub fn new(providers: Vec<Arc<ProviderHandle>>, default_provider: Option<String>) -> Self {
        Self {
            providers,
            default_provider,
        }
    }

    /// Providers in declaration order.
    pub fn providers(&self) -> &[Arc<ProviderHandle>] {
        &self.providers
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ProviderHandle>> {
        self.providers.iter().find(|p| p.id() == id)
    }

    /// The provider model-based routing falls back to when nothing matches.
    pub fn default_provider(&self) -> Option<&str> {
        self.default_provider.as_deref()
    }

    /// Union of every enabled provider's declared models, deduplicated in
    /// first-seen order. Serves `GET /v1/models`.
    pub fn all_models(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut models = Vec::new();
        for handle in &self.providers {
            if !handle.descriptor.enabled {
                continue;
            }
            for model in handle.adapter.list_models() {
                if seen.insert(model.clone()) {
                    models.push(model);
                }
            }
        }
        models
    }
}
