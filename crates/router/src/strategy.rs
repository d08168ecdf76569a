//! Selection strategies
//!
//! Each strategy is a pure function over the filtered eligible set, with
//! the small amount of cross-call state it needs (an atomic cursor, the
//! smooth-WRR running totals, the shuffle deck) held inside the strategy
//! value. State is keyed by provider id so a registry swap on hot reload
//! does not reset rotation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;

use crate::filter::RequestFingerprint;
use crate::registry::{ProviderHandle, Registry};
use crate::{Result, RouteError};

pub enum Strategy {
    /// Priority order, with parallel fan-out to the remaining candidates on
    /// a failover-eligible error. The full ordered list is returned; the
    /// handler owns the fan-out control flow.
    Failover,
    /// Atomic counter modulo the eligible count, declaration order.
    RoundRobin { counter: AtomicUsize },
    /// Nginx-style smooth weighted round-robin.
    WeightedRoundRobin { current: Mutex<HashMap<String, i64>> },
    /// Dealt-deck shuffle: every provider is picked once before any is
    /// picked twice.
    Shuffle { deck: Mutex<Vec<String>> },
    /// Longest model-mapping prefix wins; configured default as fallback.
    ModelBased,
}

impl Strategy {
    /// Parse a strategy name from configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "failover" => Some(Strategy::Failover),
            "round_robin" => Some(Strategy::RoundRobin {
                counter: AtomicUsize::new(0),
            }),
            "weighted_round_robin" => Some(Strategy::WeightedRoundRobin {
                current: Mutex::new(HashMap::new()),
            }),
            "shuffle" => Some(Strategy::Shuffle {
                deck: Mutex::new(Vec::new()),
            }),
            "model_based" => Some(Strategy::ModelBased),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Failover => "failover",
            Strategy::RoundRobin { .. } => "round_robin",
            Strategy::WeightedRoundRobin { .. } => "weighted_round_robin",
            Strategy::Shuffle { .. } => "shuffle",
            Strategy::ModelBased => "model_based",
        }
    }

    /// Order the eligible set. The first entry is the provider to attempt;
    /// under failover the rest are the fan-out candidates.
    pub fn select(
        &self,
        registry: &Registry,
        eligible: &[Arc<ProviderHandle>],
        fingerprint: &RequestFingerprint,
    ) -> Result<Vec<Arc<ProviderHandle>>> {
        debug_assert!(!eligible.is_empty());
        match self {
            Strategy::Failover => {
                let mut ordered: Vec<Arc<ProviderHandle>> = eligible.to_vec();
                // Stable sort keeps declaration order within a priority.
                ordered.sort_by(|a, b| b.descriptor.priority.cmp(&a.descriptor.priority));
                Ok(ordered)
            }
            Strategy::RoundRobin { counter } => {
                let idx = counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
                Ok(vec![Arc::clone(&eligible[idx])])
            }
            Strategy::WeightedRoundRobin { current } => {
                let mut current = current.lock().unwrap();
                let total: i64 = eligible
                    .iter()
                    .map(|p| p.descriptor.weight.max(1) as i64)
                    .sum();
                let mut best: Option<(usize, i64)> = None;
                for (idx, handle) in eligible.iter().enumerate() {
                    let entry = current.entry(handle.id().to_string()).or_insert(0);
                    *entry += handle.descriptor.weight.max(1) as i64;
                    match best {
                        Some((_, best_current)) if *entry <= best_current => {}
                        _ => best = Some((idx, *entry)),
                    }
                }
                let (idx, _) = best.expect("eligible set is non-empty");
                *current
                    .entry(eligible[idx].id().to_string())
                    .or_insert(0) -= total;
                Ok(vec![Arc::clone(&eligible[idx])])
            }
            Strategy::Shuffle { deck } => {
                let mut deck = deck.lock().unwrap();
                loop {
                    while let Some(id) = deck.pop() {
                        if let Some(handle) = eligible.iter().find(|p| p.id() == id) {
                            return Ok(vec![Arc::clone(handle)]);
                        }
                        // Provider no longer eligible; it rejoins at the
                        // next reshuffle.
                    }
                    let mut ids: Vec<String> =
                        eligible.iter().map(|p| p.id().to_string()).collect();
                    ids.shuffle(&mut rand::rng());
                    *deck = ids;
                }
            }
            Strategy::ModelBased => {
                let best = eligible
                    .iter()
                    .filter_map(|handle| {
                        model_match_len(handle, &fingerprint.model).map(|len| (len, handle))
                    })
                    .max_by_key(|(len, _)| *len);
                if let Some((_, handle)) = best {
                    return Ok(vec![Arc::clone(handle)]);
                }
                if let Some(default_id) = registry.default_provider()
                    && let Some(handle) = eligible.iter().find(|p| p.id() == default_id)
                {
                    return Ok(vec![Arc::clone(handle)]);
                }
                Err(RouteError::ModelUnsupported(fingerprint.model.clone()))
            }
        }
    }
}

/// Longest prefix-match length of the provider's mapping keys against the
/// model, with an exact declared model counting as a full-length match.
fn model_match_len(handle: &ProviderHandle, model: &str) -> Option<usize> {
    let mapping_len = handle
        .descriptor
        .model_mapping
        .keys()
        .filter(|prefix| model.starts_with(prefix.as_str()))
        .map(String::len)
        .max();
    let declared = handle
        .descriptor
        .models
        .iter()
        .any(|m| m == model)
        .then_some(model.len());
    mapping_len.max(declared)
}
