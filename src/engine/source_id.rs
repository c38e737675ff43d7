// src/engine/source_id.rs - heuristic source identification for unhinted events

use std::collections::HashMap;

use unicode_normalization::UnicodeNormalization;

/// Decides whether a piece of raw text plausibly came from a named source.
/// Consulted only for events that arrive without a source hint; a hint, when
/// present, is authoritative and bypasses this check entirely.
pub trait SourceMatcher: Send + Sync {
    fn looks_like_source(&self, text: &str, source_name: &str) -> bool;
}

/// Substring-based matcher: text matches a source when it mentions the source
/// name itself or any marker phrase registered for it. Comparison is
/// case-insensitive and NFKC-normalized, so fullwidth and otherwise decorated
/// spellings still match.
#[derive(Debug, Default)]
pub struct DefaultSourceMatcher {
    markers: HashMap<String, Vec<String>>,
}

impl DefaultSourceMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extra marker phrase for a source.
    pub fn with_marker(mut self, source_name: &str, marker: &str) -> Self {
        self.markers
            .entry(normalize(source_name))
            .or_default()
            .push(normalize(marker));
        self
    }
}

impl SourceMatcher for DefaultSourceMatcher {
    fn looks_like_source(&self, text: &str, source_name: &str) -> bool {
        let text = normalize(text);
        let source = normalize(source_name);
        if text.contains(&source) {
            return true;
        }
        self.markers
            .get(&source)
            .is_some_and(|markers| markers.iter().any(|m| text.contains(m)))
    }
}

fn normalize(input: &str) -> String {
    input.nfkc().collect::<String>().to_lowercase()
}
