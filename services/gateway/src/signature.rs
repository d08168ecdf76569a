//! Thinking-signature cache and request-side thinking preparation
//!
//! Backends reject assistant thinking blocks whose signature they did not
//! emit. The gateway caches signatures observed on response streams, keyed
//! by (model group, SHA-256 of the thinking text), so a block can be
//! re-signed when the conversation is replayed toward a sibling model of
//! the same group. Blocks that remain unsigned after lookup are stripped
//! before forwarding. The cache is bounded with TinyLFU eviction and a
//! three-hour TTL; a miss is never an error, it just means stripping.

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Stable hash of thinking text, usable as a cache key component.
pub fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Concurrent signature store.
pub struct SignatureCache {
    cache: moka::sync::Cache<(String, String), String>,
}

impl SignatureCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: moka::sync::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, group: &str, hash: &str) -> Option<String> {
        self.cache.get(&(group.to_string(), hash.to_string()))
    }

    pub fn insert(&self, group: &str, hash: &str, signature: String) {
        self.cache
            .insert((group.to_string(), hash.to_string()), signature);
    }
}

/// What request-side preparation did to the body's thinking blocks.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ThinkingSummary {
    pub signed: usize,
    pub attached: usize,
    pub stripped: usize,
}

/// Whether any assistant message carries a thinking block that already has
/// a signature (the request-fingerprint bit).
pub fn has_signed_thinking(body: &Value) -> bool {
    for_each_thinking_block(body, |block| {
        block
            .get("signature")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    })
}

fn for_each_thinking_block(body: &Value, mut pred: impl FnMut(&Value) -> bool) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return false;
    };
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(content) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("thinking") && pred(block) {
                return true;
            }
        }
    }
    false
}

/// Sign or strip the thinking blocks of assistant messages for the target
/// model group. Signed blocks pass untouched; unsigned blocks get a cached
/// signature when one exists for (group, hash(text)); the rest are removed
/// so the backend does not reject the request.
pub fn prepare_thinking(body: &mut Value, target_group: &str, cache: &SignatureCache) -> ThinkingSummary {
    let mut summary = ThinkingSummary::default();
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return summary;
    };
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for block in content.iter_mut() {
            if block.get("type").and_then(Value::as_str) != Some("thinking") {
                continue;
            }
            let signed = block
                .get("signature")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            if signed {
                summary.signed += 1;
                continue;
            }
            let Some(text) = block.get("thinking").and_then(Value::as_str) else {
                continue;
            };
            if let Some(signature) = cache.get(target_group, &text_hash(text)) {
                block["signature"] = Value::String(signature);
                summary.attached += 1;
            }
        }
        let before = content.len();
        content.retain(|block| {
            block.get("type").and_then(Value::as_str) != Some("thinking")
                || block
                    .get("signature")
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.is_empty())
        });
        summary.stripped += before - content.len();
    }
    if summary.stripped > 0 || summary.attached > 0 {
        debug!(
            group = target_group,
            attached = summary.attached,
            stripped = summary.stripped,
            "prepared thinking blocks"
        );
    }
    summary
}
