//! Credential records
//!
//! One `CredentialRecord` per (provider, key) pair, living as long as the
//! provider descriptor that references it. The secret material is wrapped in
//! `SecretString` and only exposed by the adapter at header-construction
//! time; nothing in this crate logs or serializes it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use common::SecretString;
use tracing::info;

use crate::bucket::TokenBucket;
use crate::error::Result;

/// An OAuth access token cached on a credential, with its absolute expiry
/// in unix milliseconds.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at_millis: u64,
}

/// The secret material a credential carries, in the shape its provider
/// variant expects.
pub enum CredentialMaterial {
    /// Plain API key, injected into a provider-defined header.
    ApiKey(SecretString),
    /// Bearer token for `authorization: Bearer ...` injection.
    Bearer(SecretString),
    /// AWS signing key pair for SigV4-signed requests.
    AwsSigV4 {
        access_key_id: String,
        secret_access_key: SecretString,
        region: String,
    },
    /// OAuth refresh token exchanged for short-lived access tokens. The
    /// current access token is cached here between refreshes.
    OAuthRefresh {
        refresh_token: SecretString,
        token_url: String,
        cached: tokio::sync::Mutex<Option<CachedToken>>,
    },
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            CredentialMaterial::ApiKey(_) => "api_key",
            CredentialMaterial::Bearer(_) => "bearer",
            CredentialMaterial::AwsSigV4 { .. } => "aws_sigv4",
            CredentialMaterial::OAuthRefresh { .. } => "oauth_refresh",
        };
        write!(f, "CredentialMaterial({kind})")
    }
}

/// A single credential with its rate buckets and live usage counters.
#[derive(Debug)]
pub struct CredentialRecord {
    pub id: String,
    pub material: CredentialMaterial,
    pub rpm: TokenBucket,
    pub tpm: TokenBucket,
    /// Explicit selection priority; higher wins. Credentials without one
    /// compete at priority 0.
    pub priority: u32,
    /// Selection weight for smooth weighted round-robin. 1 = unweighted.
    pub weight: u32,
    in_flight: AtomicU32,
    swrr_current: AtomicI64,
    learned_rpm: AtomicBool,
    learned_tpm: AtomicBool,
}

impl CredentialRecord {
    pub fn new(
        id: impl Into<String>,
        material: CredentialMaterial,
        rpm_limit: i64,
        tpm_limit: i64,
        priority: u32,
        weight: u32,
    ) -> Self {
        Self {
            id: id.into(),
            material,
            rpm: TokenBucket::per_minute(rpm_limit),
            tpm: TokenBucket::per_minute(tpm_limit),
            priority,
            weight: weight.max(1),
            in_flight: AtomicU32::new(0),
            swrr_current: AtomicI64::new(0),
            learned_rpm: AtomicBool::new(false),
            learned_tpm: AtomicBool::new(false),
        }
    }

    /// Whether both buckets could admit a request of the given cost.
    pub fn eligible(&self, estimated_cost: u64) -> bool {
        self.rpm.can_admit(1) && self.tpm.can_admit(estimated_cost)
    }

    /// Admit a request: consume one RPM token and reserve the estimated TPM
    /// cost. Both consumptions succeed or neither does.
    pub fn admit(&self, estimated_cost: u64) -> Result<()> {
        self.rpm.try_consume(1)?;
        if let Err(e) = self.tpm.try_consume(estimated_cost) {
            self.rpm.refund(1);
            return Err(e);
        }
        Ok(())
    }

    /// Return the RPM token of an admission that was aborted before the
    /// request was sent (adapter or auth failure). The TPM reservation is
    /// returned separately through `reconcile` with zero actual usage.
    pub fn refund_request_token(&self) {
        self.rpm.refund(1);
    }

    /// Reconcile the TPM reservation against the actual token usage. If the
    /// actual usage is unknown (cancelled request, no usage reported), pass
    /// `actual = 0` to refund the full reservation.
    pub fn reconcile(&self, estimated_cost: u64, actual: u64) {
        if actual > estimated_cost {
            self.tpm.force_consume(actual - estimated_cost);
        } else if actual < estimated_cost {
            self.tpm.refund(estimated_cost - actual);
        }
    }

    pub fn in_flight_inc(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight_dec(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn swrr_add(&self, delta: i64) -> i64 {
        self.swrr_current.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// Apply limits observed in provider rate-limit response headers. Each
    /// bucket is rebuilt at most the first time a given limit is learned and
    /// thereafter whenever the reported value changes the configured one.
    pub fn learn_limits(&self, requests_limit: Option<i64>, tokens_limit: Option<i64>) {
        if let Some(rpm) = requests_limit {
            self.rpm.set_limit(rpm);
            if !self.learned_rpm.swap(true, Ordering::Relaxed) {
                info!(credential_id = %self.id, rpm, "learned request limit from upstream");
            }
        }
        if let Some(tpm) = tokens_limit {
            self.tpm.set_limit(tpm);
            if !self.learned_tpm.swap(true, Ordering::Relaxed) {
                info!(credential_id = %self.id, tpm, "learned token limit from upstream");
            }
        }
    }
}
