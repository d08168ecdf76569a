//! Provider routing
//!
//! Given a request fingerprint and the current fleet snapshot, the router
//! filters providers down to the eligible set (enabled, serves the model,
//! circuit admits, at least one credential has bucket capacity) and then
//! applies the configured selection strategy. The router owns only strategy
//! state (counters, smooth-WRR totals, the shuffle deck); fleet state lives
//! in the registry, credential pool, and health tracker.

pub mod filter;
pub mod registry;
pub mod strategy;

pub use filter::RequestFingerprint;
pub use registry::{ProviderHandle, Registry};
pub use strategy::Strategy;

use std::sync::Arc;

use health::HealthTracker;
use tracing::debug;

use crate::filter::{filter_providers, FilterOutcome};

/// Typed routing failures, each mapping to one client-facing error class.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no eligible provider for this request")]
    NoEligibleProvider,

    #[error("all credentials of every candidate provider are rate limited")]
    RateLimitedAllKeys,

    #[error("no provider serves model {0}")]
    ModelUnsupported(String),

    #[error("all providers in the failover cascade failed: {0}")]
    FailoverExhausted(String),
}

/// Result alias for routing.
pub type Result<T> = std::result::Result<T, RouteError>;

/// The router: strategy plus the mutable strategy state it needs across
/// calls. Stateless with respect to the fleet.
pub struct Router {
    strategy: Strategy,
}

impl Router {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Whether the configured strategy retries failover-eligible errors on
    /// other providers.
    pub fn is_failover(&self) -> bool {
        matches!(self.strategy, Strategy::Failover { .. })
    }

    /// Produce the ordered candidate list for one request.
    ///
    /// Non-failover strategies return exactly one provider. The failover
    /// strategy returns every eligible provider in priority order: the
    /// first is the primary attempt and the rest are the parallel fan-out
    /// set consulted after a failover-eligible error.
    pub fn candidates(
        &self,
        registry: &Registry,
        tracker: &HealthTracker,
        fingerprint: &RequestFingerprint,
    ) -> Result<Vec<Arc<ProviderHandle>>> {
        let eligible = match filter_providers(registry, tracker, fingerprint) {
            FilterOutcome::Eligible(eligible) => eligible,
            FilterOutcome::NoModelMatch => {
                return Err(RouteError::ModelUnsupported(fingerprint.model.clone()));
            }
            FilterOutcome::AllRateLimited => return Err(RouteError::RateLimitedAllKeys),
            FilterOutcome::NoneEligible => return Err(RouteError::NoEligibleProvider),
        };

        let picked = self.strategy.select(registry, &eligible, fingerprint)?;
        debug!(
            strategy = %self.strategy.label(),
            candidates = picked.len(),
            primary = %picked[0].descriptor.id,
            "route computed"
        );
        Ok(picked)
    }
}
