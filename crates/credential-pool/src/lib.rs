//! Per-credential rate limiting and credential selection
//!
//! Each upstream credential carries two token buckets (requests per minute
//! and tokens per minute) plus an in-flight counter. Admission of a request
//! consumes one RPM token and reserves the estimated TPM cost; the
//! reservation is reconciled against the actual usage once the response
//! terminates.
//!
//! Selection within a provider scans the eligible credentials (both buckets
//! can admit the estimated cost) and picks by policy: explicit priorities
//! first, smooth weighted round-robin among weighted peers of equal
//! priority, otherwise least in-flight.

pub mod bucket;
pub mod credential;
pub mod error;
pub mod pool;

pub use bucket::TokenBucket;
pub use credential::{CachedToken, CredentialMaterial, CredentialRecord};
pub use error::{Error, Result};
pub use pool::{CredentialPool, CredentialUsage};
