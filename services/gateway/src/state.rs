//! Shared application state

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use health::HealthTracker;
use metrics_exporter_prometheus::PrometheusHandle;
use router::{Registry, Router};

use crate::config::Config;
use crate::signature::SignatureCache;

/// State threaded through every handler. Cheap to clone; the registry slot
/// holds the current immutable fleet snapshot and is swapped on reload.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

pub struct Inner {
    pub config: Config,
    pub registry: RwLock<Arc<Registry>>,
    pub router: Router,
    pub tracker: Arc<HealthTracker>,
    pub signatures: Arc<SignatureCache>,
    pub http: reqwest::Client,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Registry,
        router: Router,
        tracker: HealthTracker,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let signatures = Arc::new(SignatureCache::new(
            config.signature_cache.capacity,
            Duration::from_secs(config.signature_cache.ttl_secs),
        ));
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(Arc::new(registry)),
                router,
                tracker: Arc::new(tracker),
                signatures,
                http,
                metrics,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn metrics_handle(&self) -> Option<&PrometheusHandle> {
        self.inner.metrics.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.inner.tracker
    }

    pub fn signatures(&self) -> &Arc<SignatureCache> {
        &self.inner.signatures
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    /// The current fleet snapshot. Requests hold the snapshot they read at
    /// dispatch; a concurrent reload does not affect them. The lock guards
    /// only the pointer swap and is never held across I/O.
    pub fn registry(&self) -> Arc<Registry> {
        self.inner.registry.read().unwrap().clone()
    }

    /// Swap in a freshly built snapshot (hot reload).
    pub fn replace_registry(&self, registry: Registry) {
        *self.inner.registry.write().unwrap() = Arc::new(registry);
    }
}
