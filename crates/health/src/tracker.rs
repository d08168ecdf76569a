//! Provider id → health record map
//!
//! Records are created on first sight and kept for the process lifetime, so
//! circuit state survives configuration reloads: a provider that was OPEN
//! before a config edit is still OPEN after it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::breaker::{BreakerConfig, HealthRecord};

/// Shared health tracker for the whole fleet.
#[derive(Debug)]
pub struct HealthTracker {
    config: BreakerConfig,
    records: RwLock<HashMap<String, Arc<HealthRecord>>>,
}

impl HealthTracker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the record for a provider, creating it CLOSED on first use.
    pub fn record(&self, provider_id: &str) -> Arc<HealthRecord> {
        if let Some(record) = self.records.read().unwrap().get(provider_id) {
            return Arc::clone(record);
        }
        let mut records = self.records.write().unwrap();
        Arc::clone(
            records
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(HealthRecord::new(provider_id, self.config))),
        )
    }

    /// Per-provider summaries for the admin endpoint.
    pub fn summaries(&self) -> HashMap<String, serde_json::Value> {
        self.records
            .read()
            .unwrap()
            .iter()
            .map(|(id, record)| (id.clone(), record.summary()))
            .collect()
    }
}
