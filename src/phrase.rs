//! C1 Phrase Extractor (spec.md §4.1): title → ordered, de-duplicated
//! multi-word phrases used for keyword retrieval.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};

use crate::domain::Phrase;

const MAX_PHRASES: usize = 12;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+").unwrap());

/// The fixed English stop-word set named in spec.md §4.1 step 2. Extended
/// slightly beyond the mandatory list with a handful of common pronouns, as
/// the spec permits ("implementers may extend").
static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does",
        "did", "will", "would", "could", "should", "may", "might", "must", "can", "this", "that",
        "these", "those", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us",
        "them", "my", "your", "his", "its", "our", "their",
    ]
    .into_iter()
    .collect()
});

/// Tokenize a title: lowercase, extract word tokens, drop short/stop words.
/// Shared with C3's title-similarity scoring in [`crate::engine::rescore`], since
/// spec.md §4.5 defines title similarity over the same "meaningful tokens"
/// notion (there: length > 2; here: length > 2 as well, since C1 drops
/// tokens of length <= 2 per step 2).
pub fn meaningful_tokens(title: &str) -> Vec<String> {
    let lower = title.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(t.as_str()))
        .collect()
}

/// Form every consecutive window of `n` meaningful tokens, discarding
/// windows with an internal duplicate (spec.md §4.1 step 3), preserving
/// first-occurrence order and deduplicating on the full phrase string
/// (step 4).
fn windows_of(tokens: &[String], n: usize) -> Vec<Phrase> {
    if tokens.len() < n {
        return Vec::new();
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for window in tokens.windows(n) {
        let mut distinct = HashSet::with_capacity(n);
        if !window.iter().all(|t| distinct.insert(t.as_str())) {
            continue; // internal repeat, e.g. "test test"
        }
        let phrase = window.join(" ");
        if seen.insert(phrase.clone()) {
            out.push(Phrase(phrase));
        }
    }
    out
}

/// Extract phrases from a title at a requested length `n` (spec.md §4.1).
/// `n` must be 2 or 3; other values are treated as 3 (the caller's
/// responsibility per the public contract, but we do not panic on misuse).
pub fn extract_phrases(title: &str, n: usize) -> Vec<Phrase> {
    let n = if n == 2 { 2 } else { 3 };
    let tokens = meaningful_tokens(title);

    let mut phrases = windows_of(&tokens, n);
    if phrases.is_empty() && n > 2 {
        // Fallback N-1, repeating down to N=2 (step 5). Since n is capped
        // at 3 here, the only fallback step is 3 -> 2.
        phrases = windows_of(&tokens, n - 1);
    }

    phrases.truncate(MAX_PHRASES);
    phrases
}
