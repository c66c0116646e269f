//! C3 Text Normalizer (spec.md §4.3) plus the text-similarity primitives
//! shared with C5's rescoring pass (spec.md §4.5): stemming, title
//! similarity, and stemmed-word overlap. Grounded on
//! `original_source/SemanticSimilarity/preprocessing.py` for the pipeline
//! order and `vector_db.py`'s `_stem_words` / `_calculate_title_similarity`
//! for the exact scoring helpers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;
use crate::domain::{CanonicalText, WorkItem};

static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[\s\S]*?```|~~~[\s\S]*?~~~").unwrap());
static INLINE_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`\n]*`").unwrap());
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s<>\)\]]+").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Boilerplate patterns removed verbatim, case-insensitively (spec.md §4.3
/// step 8), grounded on `preprocessing.py`'s `_remove_boilerplate` pattern
/// list.
static BOILERPLATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)as a user,?\s*i want\s*",
        r"(?i)as a \w+,\s*i want\s*",
        r"(?i)given that\s*",
        r"(?i)when i\s*",
        r"(?i)then i\s*",
        r"(?i)acceptance criteria:?\s*",
        r"(?i)definition of done:?\s*",
        r"(?i)user story:?\s*",
        r"(?i)task:?\s*",
        r"(?i)bug:?\s*",
        r"(?i)epic:?\s*",
        r"(?i)feature:?\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Stop words used for title/description similarity (spec.md §4.5 "Title
/// similarity"). Distinct list from C1's phrase-extraction stop words,
/// matching `vector_db.py::_calculate_title_similarity`'s smaller set.
static SIMILARITY_STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    ]
    .into_iter()
    .collect()
});

/// Field-priority concatenation order (spec.md §4.3 step 1). `original_source`'s
/// `preprocessing.py` includes an additional `found_in` field that spec.md's
/// list omits; per SPEC_FULL.md §1, the spec's explicit ordering is the
/// contract and wins.
fn combine_fields(item: &WorkItem) -> String {
    let fields: [&str; 10] = [
        item.title.as_str(),
        item.description.as_str(),
        item.acceptance_criteria.as_str(),
        item.repro_steps.as_str(),
        item.business_value.as_str(),
        item.work_item_type.as_str(),
        item.area_path.as_str(),
        item.tags_joined().as_str(),
        item.iteration_path.as_str(),
        item.state.as_str(),
    ];
    fields
        .into_iter()
        .filter(|f| !f.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn strip_html(input: &str) -> String {
    // html5ever (via scraper) decodes entities while parsing, so the text
    // nodes below are already entity-free.
    let fragment = scraper::Html::parse_fragment(input);
    fragment.root_element().text().collect::<Vec<_>>().join(" ")
}

fn markdown_to_text(input: &str) -> String {
    let parser = pulldown_cmark::Parser::new(input);
    let mut html_out = String::new();
    pulldown_cmark::html::push_html(&mut html_out, parser);
    strip_html(&html_out)
}

/// Run the full C3 pipeline (spec.md §4.3). Returns `None` if the item
/// should be skipped: empty field assembly, or final length outside
/// `[min_text_length, max_text_length]`.
pub fn normalize(item: &WorkItem, cfg: &Config) -> Option<CanonicalText> {
    let combined = combine_fields(item);
    if combined.trim().len() < cfg.min_text_length {
        return None;
    }

    let mut text = strip_html(&combined);
    text = markdown_to_text(&text);
    text = CODE_FENCE_RE.replace_all(&text, " ").into_owned();
    text = INLINE_CODE_RE.replace_all(&text, " ").into_owned();
    text = URL_RE.replace_all(&text, " ").into_owned();
    text = EMAIL_RE.replace_all(&text, " ").into_owned();
    for pattern in BOILERPLATE_PATTERNS.iter() {
        text = pattern.replace_all(&text, " ").into_owned();
    }

    let collapsed = WHITESPACE_RE.replace_all(&text, " ");
    let normalized: String = collapsed.trim().nfkc().collect();

    if normalized.len() > cfg.max_text_length {
        let truncated: String = normalized.chars().take(cfg.max_text_length).collect();
        if truncated.len() < cfg.min_text_length {
            return None;
        }
        return Some(CanonicalText(truncated));
    }

    if normalized.len() < cfg.min_text_length {
        return None;
    }

    Some(CanonicalText(normalized))
}

/// Crude suffix-stripping stemmer (spec.md §4.5 "Stemming"), a direct
/// transliteration of `vector_db.py::_stem_words`.
pub fn stem_word(word: &str) -> String {
    if word.len() > 3 {
        if let Some(stripped) = word.strip_suffix("ing") {
            return stripped.to_string();
        }
        if let Some(stripped) = word.strip_suffix("ed") {
            return stripped.to_string();
        }
        if word.len() > 4 {
            if let Some(stripped) = word.strip_suffix('s') {
                return stripped.to_string();
            }
        }
    }
    word.to_string()
}

pub fn stem_words(words: &[String]) -> Vec<String> {
    words.iter().map(|w| stem_word(w)).collect()
}

/// Tokens considered "meaningful" for title/description similarity: length
/// > 2, stop words dropped (spec.md §4.5).
fn similarity_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .filter(|t| !SIMILARITY_STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Title similarity (spec.md §4.5): exact normalized match -> 1.0, else
/// Jaccard over meaningful tokens with a 1.2x boost (capped at 1.0) when
/// five or more tokens are shared.
pub fn title_similarity(a: &str, b: &str) -> f32 {
    let a_norm = a.trim().to_lowercase();
    let b_norm = b.trim().to_lowercase();
    if !a_norm.is_empty() && a_norm == b_norm {
        return 1.0;
    }

    let tokens_a: HashSet<String> = similarity_tokens(a).into_iter().collect();
    let tokens_b: HashSet<String> = similarity_tokens(b).into_iter().collect();
    jaccard_with_boost(&tokens_a, &tokens_b)
}

/// Stemmed-word Jaccard overlap used for description similarity (spec.md
/// §4.5 "description stemmed-word overlap"). Unlike title similarity, this
/// has no exact-match short circuit or boost — callers apply their own cap
/// and multiplier per the rescoring formula.
pub fn stemmed_overlap_ratio(a: &str, b: &str) -> f32 {
    let tokens_a: HashSet<String> = stem_words(&similarity_tokens(a)).into_iter().collect();
    let tokens_b: HashSet<String> = stem_words(&similarity_tokens(b)).into_iter().collect();
    jaccard(&tokens_a, &tokens_b)
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

fn jaccard_with_boost(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    let base = if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    };
    if intersection >= 5 {
        (base * 1.2).min(1.0)
    } else {
        base
    }
}

/// Area-path Jaccard over backslash-split segments (spec.md §4.5).
pub fn area_path_jaccard(a: &str, b: &str) -> f32 {
    let segs_a: HashSet<&str> = a.split('\\').filter(|s| !s.is_empty()).collect();
    let segs_b: HashSet<&str> = b.split('\\').filter(|s| !s.is_empty()).collect();
    if segs_a.is_empty() && segs_b.is_empty() {
        return 0.0;
    }
    let intersection = segs_a.intersection(&segs_b).count();
    let union = segs_a.union(&segs_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Tag overlap count, lowercased (spec.md §4.5).
pub fn tag_overlap_count(a: &[String], b: &[String]) -> usize {
    let set_a: HashSet<String> = a.iter().map(|t| t.to_lowercase()).collect();
    let set_b: HashSet<String> = b.iter().map(|t| t.to_lowercase()).collect();
    set_a.intersection(&set_b).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(title: &str, description: &str) -> WorkItem {
        WorkItem {
            id: 1,
            title: title.to_string(),
            description: description.to_string(),
            acceptance_criteria: String::new(),
            repro_steps: String::new(),
            business_value: String::new(),
            work_item_type: "Bug".to_string(),
            state: "Active".to_string(),
            priority: Some(2),
            area_path: "Proj\\Team".to_string(),
            iteration_path: "Proj\\Sprint1".to_string(),
            tags: vec!["a11y".to_string()],
            assigned_to: None,
            created_date: Utc::now(),
            changed_date: Utc::now(),
        }
    }

    #[test]
    fn drops_items_below_min_length() {
        let cfg = Config::default();
        let short = item("hi", "");
        assert!(normalize(&short, &cfg).is_none());
    }

    #[test]
    fn strips_html_markdown_code_urls_emails_and_boilerplate() {
        let cfg = Config::default();
        let description = "As a user, I want <b>bold</b> text, see http://example.com, mail me at a@b.com, ```code block``` and `inline` code.";
        let wi = item(
            "A reasonably long and descriptive title about login flows",
            description,
        );
        let canon = normalize(&wi, &cfg).expect("should produce canonical text");
        let text = canon.as_str();
        assert!(!text.contains("http://"));
        assert!(!text.contains('@'));
        assert!(!text.contains("```"));
        assert!(!text.to_lowercase().contains("as a user"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn truncates_to_max_len() {
        let mut cfg = Config::default();
        cfg.max_text_length = 50;
        cfg.min_text_length = 5;
        let long_desc = "word ".repeat(200);
        let wi = item("Some reasonably long title text", &long_desc);
        let canon = normalize(&wi, &cfg).expect("should produce canonical text");
        assert!(canon.len() <= 50);
    }

    #[test]
    fn exact_title_match_is_one() {
        assert_eq!(title_similarity("Fix login bug", "fix login bug"), 1.0);
    }

    #[test]
    fn stemming_strips_common_suffixes() {
        assert_eq!(stem_word("running"), "runn");
        assert_eq!(stem_word("fixed"), "fix");
        assert_eq!(stem_word("buttons"), "button");
        assert_eq!(stem_word("ok"), "ok");
    }

    #[test]
    fn area_path_jaccard_matches_identical_paths() {
        assert_eq!(
            area_path_jaccard("Proj\\Team\\Sub", "Proj\\Team\\Sub"),
            1.0
        );
    }
}
