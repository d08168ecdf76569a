//! Credential selection within a provider
//!
//! The pool scans the provider's credentials at selection time, keeps the
//! ones whose buckets can admit the request, and picks one by policy:
//!
//! 1. Highest explicit priority wins outright.
//! 2. Within the winning priority tier, explicitly weighted credentials are
//!    balanced by smooth weighted round-robin.
//! 3. An unweighted tier falls back to least in-flight, tie-broken by most
//!    remaining RPM capacity, then by a rotating cursor.
//!
//! Selection and admission are a single operation: the chosen credential's
//! buckets are debited before the pool returns it, and a concurrent race on
//! the last token simply moves on to the next candidate.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::credential::CredentialRecord;
use crate::error::{Error, Result};

/// Live usage snapshot for one credential, for the admin summary.
#[derive(Debug, Serialize)]
pub struct CredentialUsage {
    pub id: String,
    pub in_flight: u32,
    pub rpm_remaining: Option<u64>,
    pub tpm_remaining: Option<u64>,
}

/// The credentials of one provider.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Arc<CredentialRecord>>,
    cursor: AtomicUsize,
    /// Serializes smooth-WRR bookkeeping across concurrent selections so
    /// the pick sequence stays linearizable.
    swrr_lock: Mutex<()>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Arc<CredentialRecord>>) -> Self {
        Self {
            credentials,
            cursor: AtomicUsize::new(0),
            swrr_lock: Mutex::new(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn credentials(&self) -> &[Arc<CredentialRecord>] {
        &self.credentials
    }

    /// Whether any credential could currently admit a request of this cost.
    pub fn has_capacity(&self, estimated_cost: u64) -> bool {
        self.credentials.iter().any(|c| c.eligible(estimated_cost))
    }

    /// Select and admit a credential for a request of the given estimated
    /// cost. On success the credential's RPM token is consumed and its TPM
    /// reservation is made; the caller owns the in-flight increment and the
    /// later reconciliation.
    pub fn select(&self, estimated_cost: u64) -> Result<Arc<CredentialRecord>> {
        let eligible: Vec<&Arc<CredentialRecord>> = self
            .credentials
            .iter()
            .filter(|c| c.eligible(estimated_cost))
            .collect();

        if eligible.is_empty() {
            return Err(Error::RateLimitExceeded(self.exhausted_message()));
        }

        let top_priority = eligible.iter().map(|c| c.priority).max().unwrap_or(0);
        let tier: Vec<&Arc<CredentialRecord>> = eligible
            .into_iter()
            .filter(|c| c.priority == top_priority)
            .collect();

        let ordered = if tier.iter().any(|c| c.weight > 1) {
            self.order_by_swrr(&tier)
        } else {
            self.order_by_load(&tier)
        };

        for candidate in ordered {
            if candidate.admit(estimated_cost).is_ok() {
                debug!(credential_id = %candidate.id, estimated_cost, "credential admitted");
                return Ok(candidate);
            }
        }

        Err(Error::RateLimitExceeded(self.exhausted_message()))
    }

    /// Smooth weighted round-robin over one priority tier: every candidate
    /// gains its weight, the highest running total is picked and pays back
    /// the tier's total weight. Produces interleaved selections rather than
    /// bursts.
    fn order_by_swrr(&self, tier: &[&Arc<CredentialRecord>]) -> Vec<Arc<CredentialRecord>> {
        let _guard = self.swrr_lock.lock().unwrap();
        let total: i64 = tier.iter().map(|c| c.weight as i64).sum();

        let mut best_idx = 0usize;
        let mut best_current = i64::MIN;
        for (idx, candidate) in tier.iter().enumerate() {
            let current = candidate.swrr_add(candidate.weight as i64);
            if current > best_current {
                best_current = current;
                best_idx = idx;
            }
        }
        tier[best_idx].swrr_add(-total);

        let mut ordered: Vec<Arc<CredentialRecord>> =
            tier.iter().map(|c| Arc::clone(c)).collect();
        ordered.swap(0, best_idx);
        ordered
    }

    /// Default ordering: least in-flight, then largest remaining RPM share,
    /// rotating cursor as the final tie-break.
    fn order_by_load(&self, tier: &[&Arc<CredentialRecord>]) -> Vec<Arc<CredentialRecord>> {
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % tier.len().max(1);
        let mut indexed: Vec<(usize, Arc<CredentialRecord>)> = tier
            .iter()
            .enumerate()
            .map(|(i, c)| ((i + tier.len() - offset) % tier.len(), Arc::clone(c)))
            .collect();
        indexed.sort_by(|(rot_a, a), (rot_b, b)| {
            a.in_flight()
                .cmp(&b.in_flight())
                .then_with(|| {
                    b.rpm
                        .remaining_fraction()
                        .partial_cmp(&a.rpm.remaining_fraction())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| rot_a.cmp(rot_b))
        });
        indexed.into_iter().map(|(_, c)| c).collect()
    }

    /// Usage snapshot for every credential (secrets excluded by
    /// construction — `CredentialUsage` carries only counters).
    pub fn usage(&self) -> Vec<CredentialUsage> {
        self.credentials
            .iter()
            .map(|c| CredentialUsage {
                id: c.id.clone(),
                in_flight: c.in_flight(),
                rpm_remaining: finite(c.rpm.available()),
                tpm_remaining: finite(c.tpm.available()),
            })
            .collect()
    }

    fn exhausted_message(&self) -> String {
        format!(
            "all {} credentials at capacity",
            self.credentials.len()
        )
    }
}

fn finite(v: f64) -> Option<u64> {
    v.is_finite().then(|| v.max(0.0) as u64)
}
