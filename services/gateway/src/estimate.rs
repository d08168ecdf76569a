//! Request token-cost estimation
//!
//! The TPM reservation needs only a rough pre-response figure — the
//! reconciliation against reported usage corrects it on every terminal
//! outcome — so the estimate is the serialized body length divided by four
//! (the usual characters-per-token ratio for English-heavy payloads).

/// Estimated token cost of a request body, always at least 1.
pub fn estimate_cost(body: &[u8]) -> u64 {
    ((body.len() as u64) / 4).max(1)
}
