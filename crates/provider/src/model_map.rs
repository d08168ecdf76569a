//! Model-name mapping and signature model groups
//!
//! Mapping is longest-prefix: the mapping table's keys are client-facing
//! model prefixes, and the entry with the longest key that prefixes the
//! requested model wins. Unmapped models pass through unchanged for
//! variants that accept arbitrary identifiers; for the rest, the declared
//! model list is authoritative and an unmatched model makes the provider
//! ineligible.

use std::collections::HashMap;

/// Longest-prefix model mapping table.
#[derive(Debug, Clone, Default)]
pub struct ModelMap {
    /// Sorted by key length descending so the first prefix hit is longest.
    entries: Vec<(String, String)>,
}

impl ModelMap {
    pub fn new(mapping: &HashMap<String, String>) -> Self {
        let mut entries: Vec<(String, String)> = mapping
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The backend model for a client model, if any mapping key prefixes it.
    pub fn lookup(&self, client_model: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| client_model.starts_with(prefix.as_str()))
            .map(|(_, backend)| backend.as_str())
    }

    /// Length of the longest mapping key that prefixes the model, used by
    /// model-based routing to rank providers.
    pub fn match_len(&self, client_model: &str) -> Option<usize> {
        self.entries
            .iter()
            .filter(|(prefix, _)| client_model.starts_with(prefix.as_str()))
            .map(|(prefix, _)| prefix.len())
            .max()
    }
}

/// Model-group prefixes whose thinking signatures are mutually accepted.
const GROUP_PREFIXES: &[&str] = &["claude-", "gpt-", "gemini-"];

/// The signature-compatibility group of a model: sibling models sharing a
/// known family prefix accept each other's thinking signatures; anything
/// else is its own group.
pub fn model_group(model: &str) -> &str {
    for prefix in GROUP_PREFIXES {
        if model.starts_with(prefix) {
            return prefix.trim_end_matches('-');
        }
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> ModelMap {
        let mapping: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ModelMap::new(&mapping)
    }

    #[test]
    fn longest_prefix_wins() {
        let m = map(&[
            ("claude-", "generic-backend"),
            ("claude-sonnet-4", "sonnet-backend"),
        ]);
        assert_eq!(m.lookup("claude-sonnet-4-20250514"), Some("sonnet-backend"));
        assert_eq!(m.lookup("claude-opus-4"), Some("generic-backend"));
    }

    #[test]
    fn no_match_returns_none() {
        let m = map(&[("claude-", "x")]);
        assert_eq!(m.lookup("gpt-4o"), None);
        assert_eq!(m.match_len("gpt-4o"), None);
    }

    #[test]
    fn match_len_reports_longest() {
        let m = map(&[("claude-", "a"), ("claude-sonnet-", "b")]);
        assert_eq!(m.match_len("claude-sonnet-4"), Some("claude-sonnet-".len()));
        assert_eq!(m.match_len("claude-opus-4"), Some("claude-".len()));
    }

    #[test]
    fn exact_key_matches_itself() {
        let m = map(&[("m-x", "backend-x")]);
        assert_eq!(m.lookup("m-x"), Some("backend-x"));
    }

    #[test]
    fn claude_models_share_a_group() {
        assert_eq!(model_group("claude-sonnet-4-20250514"), "claude");
        assert_eq!(model_group("claude-3-5-haiku"), "claude");
    }

    #[test]
    fn gpt_and_gemini_have_their_own_groups() {
        assert_eq!(model_group("gpt-4o"), "gpt");
        assert_eq!(model_group("gemini-2.0-flash"), "gemini");
    }

    #[test]
    fn unknown_model_is_its_own_group() {
        assert_eq!(model_group("llama3:70b"), "llama3:70b");
    }
}
