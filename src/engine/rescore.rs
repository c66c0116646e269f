//! Rescoring and adaptive thresholding (spec.md §4.5 steps 7–8), a direct
//! transliteration of
//! `original_source/SemanticSimilarity/vector_db.py`'s
//! `_calculate_relevance_score` and `_get_adaptive_threshold`.

use crate::domain::WorkItem;
use crate::text::{area_path_jaccard, stemmed_overlap_ratio, tag_overlap_count, title_similarity};

const BUG_FAMILY: [&str; 2] = ["bug", "defect"];
const STORY_FAMILY: [&str; 2] = ["user story", "story"];
const TASK_FAMILY: [&str; 2] = ["task", "subtask"];

fn same_family(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    for family in [BUG_FAMILY.as_slice(), STORY_FAMILY.as_slice(), TASK_FAMILY.as_slice()] {
        if family.contains(&a.as_str()) && family.contains(&b.as_str()) {
            return true;
        }
    }
    false
}

const ACTIVE_STATES: [&str; 3] = ["active", "new", "in progress"];
const CLOSED_STATES: [&str; 3] = ["closed", "done", "resolved"];

/// `boost(seed, candidate, base_score)` from spec.md §4.5 step 7.
pub fn feature_boost(seed: &WorkItem, candidate: &WorkItem, base_score: f32) -> f32 {
    let mut multiplier = 1.0f32;

    let seed_type = seed.work_item_type.to_lowercase();
    let cand_type = candidate.work_item_type.to_lowercase();
    if seed_type == cand_type {
        multiplier += 0.15;
    } else if same_family(&seed_type, &cand_type) {
        multiplier += 0.05;
    }

    multiplier += area_path_jaccard(&seed.area_path, &candidate.area_path) * 0.10;

    let tag_overlap = tag_overlap_count(&seed.tags, &candidate.tags) as f32;
    multiplier += (tag_overlap * 0.03).min(0.08);

    let cand_state = candidate.state.to_lowercase();
    if ACTIVE_STATES.contains(&cand_state.as_str()) {
        multiplier += 0.03;
    } else if CLOSED_STATES.contains(&cand_state.as_str()) {
        multiplier += 0.01;
    }

    let title_sim = title_similarity(&seed.title, &candidate.title);
    if title_sim > 0.90 {
        multiplier += 0.20;
    } else if title_sim > 0.80 {
        multiplier += 0.15;
    } else if title_sim > 0.70 {
        multiplier += 0.10;
    } else {
        let overlap = stemmed_overlap_ratio(&seed.title, &candidate.title);
        multiplier += (overlap * 0.03).min(0.15);
    }

    let desc_overlap = stemmed_overlap_ratio(&seed.description, &candidate.description);
    multiplier += (desc_overlap * 0.02).min(0.10);

    match (seed.priority, candidate.priority) {
        (Some(a), Some(b)) if a == b => multiplier += 0.05,
        (Some(a), Some(b)) if (a - b).abs() == 1 => multiplier += 0.02,
        _ => {}
    }

    if base_score > 0.5 {
        (multiplier - 1.0) * 0.20
    } else {
        (multiplier - 1.0) * 0.05
    }
}

/// `adjusted = min(base + boost, 1.0)` (spec.md §4.5 step 7).
pub fn adjusted_score(seed: &WorkItem, candidate: &WorkItem, base_score: f32) -> f32 {
    (base_score + feature_boost(seed, candidate, base_score)).min(1.0)
}

/// Human-readable labels for which boost rules fired, for
/// `SimilarityResult::explanation_hints` (spec.md §3). Mirrors the same
/// rule checks `feature_boost` applies, kept separate so the scoring
/// arithmetic stays the single source of truth and this function can never
/// drift the adjusted score itself.
pub fn explanation_hints(seed: &WorkItem, candidate: &WorkItem) -> Vec<String> {
    let mut hints = Vec::new();

    let seed_type = seed.work_item_type.to_lowercase();
    let cand_type = candidate.work_item_type.to_lowercase();
    if seed_type == cand_type {
        hints.push("same work item type".to_string());
    } else if same_family(&seed_type, &cand_type) {
        hints.push("same type family".to_string());
    }

    let area_overlap = area_path_jaccard(&seed.area_path, &candidate.area_path);
    if area_overlap > 0.0 {
        hints.push(format!("area path overlap ({area_overlap:.2})"));
    }

    let tag_overlap = tag_overlap_count(&seed.tags, &candidate.tags);
    if tag_overlap > 0 {
        hints.push(format!("{tag_overlap} shared tag(s)"));
    }

    let cand_state = candidate.state.to_lowercase();
    if ACTIVE_STATES.contains(&cand_state.as_str()) || CLOSED_STATES.contains(&cand_state.as_str()) {
        hints.push(format!("candidate state: {}", candidate.state));
    }

    let title_sim = title_similarity(&seed.title, &candidate.title);
    if title_sim > 0.70 {
        hints.push(format!("high title similarity ({title_sim:.2})"));
    }

    match (seed.priority, candidate.priority) {
        (Some(a), Some(b)) if a == b => hints.push("matching priority".to_string()),
        (Some(a), Some(b)) if (a - b).abs() == 1 => hints.push("adjacent priority".to_string()),
        _ => {}
    }

    hints
}

/// Adaptive threshold (spec.md §4.5 step 8), computed from the base scores
/// of the candidate set.
pub fn adaptive_threshold(
    base_scores: &[f32],
    configured_default: f32,
    min_threshold: f32,
    max_threshold: f32,
) -> f32 {
    if base_scores.iter().any(|&s| s >= 0.99) {
        return configured_default.min(0.99);
    }

    if base_scores.is_empty() {
        return configured_default.clamp(min_threshold, max_threshold);
    }

    let n = base_scores.len();
    let mean = base_scores.iter().sum::<f32>() / n as f32;
    let variance = base_scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n as f32;
    let std_dev = variance.sqrt();
    let max_score = base_scores.iter().cloned().fold(f32::MIN, f32::max);

    let mut threshold = if n < 5 {
        (mean - 0.10).max(min_threshold)
    } else if std_dev < 0.05 {
        (mean + 0.05).max(min_threshold)
    } else if std_dev < 0.15 {
        (mean - 0.05).max(min_threshold)
    } else {
        (mean - 0.15).max(min_threshold)
    };

    threshold = threshold.clamp(min_threshold, max_threshold);

    if max_score < threshold {
        threshold = (max_score - 0.05).max(min_threshold);
    }

    threshold
}
