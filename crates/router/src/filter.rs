//! Pre-strategy eligibility filtering
//!
//! A provider survives the filter when all of the following hold:
//!
//! 1. it is enabled,
//! 2. its model mapping or declared model set serves the requested model,
//! 3. its circuit is CLOSED, or admits a half-open probe,
//! 4. at least one of its credentials has capacity in both buckets for the
//!    fingerprint's estimated cost.
//!
//! The filter never consumes probe slots — it peeks at the breaker so
//! providers the strategy does not pick keep their probe budget. The
//! outcome distinguishes why nothing survived, which maps directly onto the
//! router's typed errors.

use std::sync::Arc;

use health::{Admission, HealthTracker};

use crate::registry::{ProviderHandle, Registry};

/// Per-request routing inputs derived by the handler.
#[derive(Debug, Clone)]
pub struct RequestFingerprint {
    /// Client-supplied model identifier.
    pub model: String,
    /// Whether the body carries a thinking block with a signature.
    pub has_signed_thinking: bool,
    /// Pre-reservation estimate against the TPM bucket, refined after the
    /// response reports actual usage.
    pub estimated_cost: u64,
}

/// Result of the eligibility filter.
pub enum FilterOutcome {
    Eligible(Vec<Arc<ProviderHandle>>),
    /// No enabled provider serves the model at all.
    NoModelMatch,
    /// Providers serve the model and are healthy, but every credential is
    /// at its RPM/TPM ceiling.
    AllRateLimited,
    /// Everything was filtered out for health or other reasons.
    NoneEligible,
}

pub fn filter_providers(
    registry: &Registry,
    tracker: &HealthTracker,
    fingerprint: &RequestFingerprint,
) -> FilterOutcome {
    let mut eligible = Vec::new();
    let mut any_model_match = false;
    let mut any_healthy_but_limited = false;

    for handle in registry.providers() {
        if !handle.descriptor.enabled {
            continue;
        }
        if !handle.adapter.supports_model(&fingerprint.model) {
            continue;
        }
        any_model_match = true;

        let record = tracker.record(handle.id());
        if record.peek() == Admission::Reject {
            continue;
        }

        if !handle.credentials.has_capacity(fingerprint.estimated_cost) {
            any_healthy_but_limited = true;
            continue;
        }

        eligible.push(Arc::clone(handle));
    }

    if !eligible.is_empty() {
        return FilterOutcome::Eligible(eligible);
    }
    if !any_model_match {
        return FilterOutcome::NoModelMatch;
    }
    if any_healthy_but_limited {
        return FilterOutcome::AllRateLimited;
    }
    FilterOutcome::NoneEligible
}
