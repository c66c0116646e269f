//! Core data types shared across the pipeline: work items, phrases, canonical
//! text, embeddings, index records, and similarity results.
//!
//! These mirror `spec.md` §3 directly: each type documents the invariant the
//! spec assigns it, since violating one of them is an `Internal` error
//! downstream (see [`crate::error::RelatednessError`]).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// An immutable snapshot of one tracker work item, valid for the lifetime of
/// a single request (spec.md §3 "Lifecycles").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub repro_steps: String,
    pub business_value: String,
    pub work_item_type: String,
    pub state: String,
    pub priority: Option<i32>,
    pub area_path: String,
    pub iteration_path: String,
    /// Semicolon-separated multiset, stored pre-split for convenience.
    pub tags: Vec<String>,
    pub assigned_to: Option<String>,
    pub created_date: chrono::DateTime<chrono::Utc>,
    pub changed_date: chrono::DateTime<chrono::Utc>,
}

impl WorkItem {
    /// Tags as they appear on the wire: a semicolon-separated string.
    pub fn tags_joined(&self) -> String {
        self.tags.join("; ")
    }

    /// Split a raw semicolon-separated tag string the way the tracker emits
    /// it, trimming whitespace around each tag and dropping empties.
    pub fn split_tags(raw: &str) -> Vec<String> {
        raw.split(';')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// A team-to-area-path binding used to scope C2's tracker queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub area_path: Option<String>,
}

/// A non-empty ordered sequence of N meaningful words drawn from a title,
/// with no internal token repeats (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Phrase(pub String);

impl Phrase {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Phrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The post-normalization string for one work item (spec.md §3, §4.3).
/// Construction is gated on the length invariant: a `CanonicalText` only
/// exists when `min_len <= text.len() <= max_len`; anything shorter is
/// represented as `None` by the normalizer rather than as an empty value
/// here, so the invariant is enforced at the type's boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalText(pub String);

impl CanonicalText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A fixed-dimension unit vector (spec.md §3: "L2-norm = 1.0").
/// `Embedding::normalized` is the only public constructor that does *not*
/// assume the input is already unit length — every other call site that
/// receives raw floats from an external collaborator must route through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Wrap an already-unit-length vector without re-normalizing. Use only
    /// when the caller can prove the invariant already holds (e.g. loading
    /// from a persisted index that was itself written by this crate).
    pub fn from_unit_vector(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// L2-normalize defensively, per spec.md §4.4 `upsert`: "L2-normalize
    /// defensively" — the embedding provider is trusted to emit unit
    /// vectors, but the index must not assume it. Returns `None` for a
    /// zero (or near-zero) vector, which cannot be normalized.
    pub fn normalized(values: Vec<f32>) -> Option<Self> {
        let norm = l2_norm(&values);
        if norm < 1e-12 {
            return None;
        }
        let scaled = values.iter().map(|v| v / norm).collect();
        Some(Self { values: scaled })
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// `‖v‖ = 1 ± 1e-5`, per spec.md §4.4 invariants.
    pub fn is_unit(&self) -> bool {
        (l2_norm(&self.values) - 1.0).abs() <= 1e-5
    }

    /// Inner product with another embedding of the same dimension; equals
    /// cosine similarity since both vectors are unit length (GLOSSARY).
    pub fn inner_product(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Where an embedding came from: the real provider, or the deterministic
/// content-hash fallback (spec.md §4.5 step 3, §9 Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingSource {
    Provider,
    HashFallback,
}

/// Metadata recorded about how one record's embedding was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSourceInfo {
    pub source: EmbeddingSource,
    pub model: Option<String>,
    pub tokens: Option<i64>,
}

/// One record in the Embedding Index (spec.md §3): exactly one per id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub work_item_id: i64,
    pub embedding: Embedding,
    pub work_item_snapshot: WorkItem,
    pub embedding_source_info: EmbeddingSourceInfo,
    pub inserted_at: chrono::DateTime<chrono::Utc>,
}

/// One ranked neighbor returned from `analyze` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub work_item_id: i64,
    pub score: f32,
    pub rank: u32,
    pub matched_snapshot: WorkItem,
    pub explanation_hints: Vec<String>,
}

/// Candidate-fetch strategy (spec.md §4.2, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Laser,
    Balanced,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Laser => "laser",
            Strategy::Balanced => "balanced",
        }
    }
}

/// A structured tracker query as described in spec.md §4.2 step 4. Kept as a
/// plain data description rather than a query-builder string, since the
/// tracker collaborator (spec.md §6) is responsible for turning this into
/// whatever wire format its backend needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub project: String,
    pub exclude_id: i64,
    pub excluded_states: Vec<String>,
    pub allowed_types: Vec<String>,
    pub allowed_area_paths: Vec<String>,
    pub created_after: chrono::DateTime<chrono::Utc>,
    pub created_before: chrono::DateTime<chrono::Utc>,
    /// Title (and, for `balanced`, description) CONTAINS disjunction terms.
    pub contains_terms: Vec<String>,
    pub match_description: bool,
}

/// Diagnostics accumulated over one `analyze` call (spec.md §4.5, §7;
/// supplemented per SPEC_FULL.md §13 since the distilled spec names
/// "diagnostics" without enumerating its shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub candidate_count: usize,
    pub embedding_fallback_ids: Vec<i64>,
    pub partial: bool,
    pub slices_executed: usize,
    pub slices_short_circuited: bool,
    pub threshold_used: f32,
    pub elapsed_ms: u64,
}

/// Deduplicate work items by id, keeping first occurrence (used by C2).
pub fn dedup_by_id(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.id) {
            out.push(item);
        }
    }
    out
}
