//! C5 Relatedness Engine (spec.md §4.5): drives a request end-to-end —
//! seed -> C2 candidates -> C3 normalize -> embed -> C4 upsert -> C4 search
//! -> rescore -> adaptive threshold -> ranked results.

pub mod rescore;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::collaborators::{EmbeddingProvider, Tracker};
use crate::config::Config;
use crate::domain::{
    Diagnostics, Embedding, EmbeddingSource, EmbeddingSourceInfo, SimilarityResult, Strategy,
    WorkItem,
};
use crate::error::{RelatednessError, Result};
use crate::fetch;
use crate::hash_embedding::hash_embedding;
use crate::index::{EmbeddingIndex, UpsertCandidate};
use crate::text::{normalize, title_similarity};

/// Everything one `analyze` call needs beyond the seed itself.
pub struct AnalyzeRequest {
    pub seed_id: i64,
    pub project: String,
    pub teams: Vec<String>,
    pub allowed_types: Vec<String>,
    pub strategy: Strategy,
}

pub struct AnalyzeResponse {
    pub ranked: Vec<SimilarityResult>,
    pub diagnostics: Diagnostics,
}

/// Bookkeeping returned from [`RelatednessEngine::embed_all`], surfaced to
/// `analyze` so it can tell "some items fell back to hashing" (pipeline
/// continues, spec.md §4.5 step 3) apart from "the provider never produced a
/// single real embedding" (spec.md §7 `EmbeddingUnavailable`, when hash
/// fallback is also disabled).
struct EmbedAllOutcome {
    upsert_candidates: Vec<UpsertCandidate>,
    fallback_ids: Vec<i64>,
    partial: bool,
    provider_ever_succeeded: bool,
}

pub struct RelatednessEngine {
    tracker: Arc<dyn Tracker>,
    embeddings: Arc<dyn EmbeddingProvider>,
    config: Config,
}

impl RelatednessEngine {
    pub fn new(tracker: Arc<dyn Tracker>, embeddings: Arc<dyn EmbeddingProvider>, config: Config) -> Self {
        Self {
            tracker,
            embeddings,
            config,
        }
    }

    /// `analyze(seed_ref, strategy) -> { ranked, diagnostics }` (spec.md §4.5
    /// "Public contract").
    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.request_deadline_seconds);

        // Step 1: load the seed.
        let seed = self
            .tracker
            .get_work_item(request.seed_id)
            .await
            .map_err(|e| RelatednessError::tracker_unavailable(e.to_string()))?
            .ok_or_else(|| RelatednessError::not_found(request.seed_id))?;

        // Step 2: C2 candidates, seed first.
        let fetch_outcome = fetch::fetch(
            self.tracker.as_ref(),
            &seed,
            &request.project,
            &request.teams,
            &request.allowed_types,
            request.strategy,
            &self.config,
            deadline,
        )
        .await?;
        let candidates = fetch_outcome.items;
        let fetch_diag = fetch_outcome.diagnostics;

        if candidates.len() <= 1 {
            // Boundary behavior (spec.md §8): candidate set of size 1 (only
            // seed) -> empty ranked list, no error.
            return Ok(AnalyzeResponse {
                ranked: Vec::new(),
                diagnostics: Diagnostics {
                    candidate_count: candidates.len(),
                    partial: fetch_diag.deadline_exceeded,
                    slices_executed: fetch_diag.slices_executed,
                    slices_short_circuited: fetch_diag.slices_short_circuited,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                },
            });
        }

        // Step 3: clear + normalize + embed.
        let index_dir = self.config.vector_db_path.clone();
        let mut index = EmbeddingIndex::open(&index_dir)?;
        index.clear()?;

        let mut normalized: Vec<(WorkItem, String)> = Vec::with_capacity(candidates.len());
        for item in &candidates {
            if let Some(text) = normalize(item, &self.config) {
                normalized.push((item.clone(), text.as_str().to_string()));
            }
        }

        let embed_outcome = self.embed_all(&normalized, deadline).await;

        // spec.md §7: "EmbeddingUnavailable - All batches failed and hash
        // fallback disabled." Distinct from the ordinary per-batch fallback
        // path (which keeps going): if the provider never produced a single
        // real embedding across the whole request *and* the operator has
        // disabled the hash fallback, every candidate's `UpsertCandidate` is
        // `ok=false` and the pipeline has nothing to rank — fail fast with
        // the named error kind rather than limping to a misleading
        // "seed embedding missing" internal error.
        if !normalized.is_empty()
            && !embed_outcome.provider_ever_succeeded
            && !self.config.allow_embedding_hash_fallback
        {
            return Err(RelatednessError::embedding_unavailable(
                "embedding provider produced no successful results and hash fallback is disabled",
            ));
        }

        let EmbedAllOutcome {
            upsert_candidates,
            fallback_ids,
            partial,
            ..
        } = embed_outcome;

        // Step 4: upsert.
        index.upsert(upsert_candidates)?;

        // Step 5: locate seed's embedding (it was the first item inserted,
        // unless it was dropped by C3 or the embedding failed entirely).
        let seed_record = index
            .get(seed.id)
            .ok_or_else(|| RelatednessError::internal("seed embedding missing from index after upsert"))?;
        let seed_embedding = seed_record.embedding.clone();

        // Step 6: top (k*2) neighbors, excluding the seed.
        let k = self.config.top_k;
        let neighbors = index.search(&seed_embedding, k * 2, &[seed.id]);

        let base_scores: Vec<f32> = neighbors.iter().map(|(_, s)| *s).collect();
        let threshold = rescore::adaptive_threshold(
            &base_scores,
            self.config.similarity_threshold,
            self.config.min_similarity_threshold,
            self.config.max_similarity_threshold,
        );

        // Step 7: rescore.
        let mut scored: Vec<(i64, f32, f32)> = Vec::with_capacity(neighbors.len());
        for (id, base) in &neighbors {
            if let Some(record) = index.get(*id) {
                let adjusted = rescore::adjusted_score(&seed, &record.work_item_snapshot, *base);
                scored.push((*id, *base, adjusted));
            }
        }

        // Step 9: filter, sort, truncate, rank.
        let mut ranked: Vec<SimilarityResult> = scored
            .into_iter()
            .filter(|(_, _, adjusted)| *adjusted >= threshold)
            .filter_map(|(id, _base, adjusted)| {
                index.get(id).map(|record| SimilarityResult {
                    work_item_id: id,
                    score: adjusted,
                    rank: 0,
                    explanation_hints: rescore::explanation_hints(&seed, &record.work_item_snapshot),
                    matched_snapshot: record.work_item_snapshot.clone(),
                })
            })
            .collect();

        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        for (i, result) in ranked.iter_mut().enumerate() {
            result.rank = (i + 1) as u32;
        }

        let partial = partial || fetch_diag.deadline_exceeded;

        // spec.md §7: "Timeout — request deadline exceeded before any ranked
        // item was produced." Distinguished from the partial-results path,
        // which still returns whatever was produced (spec.md §5 "Cancellation
        // & timeouts").
        if ranked.is_empty() && Instant::now() >= deadline {
            return Err(RelatednessError::timeout());
        }

        let diagnostics = Diagnostics {
            candidate_count: candidates.len(),
            embedding_fallback_ids: fallback_ids,
            partial,
            slices_executed: fetch_diag.slices_executed,
            slices_short_circuited: fetch_diag.slices_short_circuited,
            threshold_used: threshold,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        Ok(AnalyzeResponse { ranked, diagnostics })
    }

    /// Exact-match fast path (spec.md §4.5 "variant `find_similar_to_existing_id`"):
    /// when called with a work-item-id already in the index, promote any
    /// neighbor with title-similarity > 0.90 to `adjusted = 1.0` at the
    /// front of the result list, *ahead of* general rescoring — general
    /// rescoring, including the adaptive threshold's drop-below-threshold
    /// step, still runs over every other neighbor (spec.md §4.5 step 9,
    /// "variant" paragraph). Grounded on
    /// `original_source/SemanticSimilarity/vector_db.py`'s
    /// `find_similar_work_items`, whose non-exact-match neighbors are
    /// filtered `if enhanced_score >= threshold` before truncation.
    pub fn find_similar_to_existing_id(
        &self,
        index: &EmbeddingIndex,
        existing_id: i64,
        k: usize,
    ) -> Result<Vec<SimilarityResult>> {
        let anchor = index
            .get(existing_id)
            .ok_or_else(|| RelatednessError::not_found(existing_id))?;
        let anchor_item = anchor.work_item_snapshot.clone();
        let anchor_embedding = anchor.embedding.clone();

        let neighbors = index.search(&anchor_embedding, k * 2, &[existing_id]);

        let mut exact_matches = Vec::new();
        let mut rest: Vec<(SimilarityResult, f32)> = Vec::new();

        for (id, base) in neighbors {
            let record = match index.get(id) {
                Some(r) => r,
                None => continue,
            };
            let sim = title_similarity(&anchor_item.title, &record.work_item_snapshot.title);
            if sim > 0.90 {
                exact_matches.push(SimilarityResult {
                    work_item_id: id,
                    score: 1.0,
                    rank: 0,
                    matched_snapshot: record.work_item_snapshot.clone(),
                    explanation_hints: vec!["exact-match title similarity".to_string()],
                });
            } else {
                let adjusted = rescore::adjusted_score(&anchor_item, &record.work_item_snapshot, base);
                rest.push((
                    SimilarityResult {
                        work_item_id: id,
                        score: adjusted,
                        rank: 0,
                        explanation_hints: rescore::explanation_hints(&anchor_item, &record.work_item_snapshot),
                        matched_snapshot: record.work_item_snapshot.clone(),
                    },
                    base,
                ));
            }
        }

        let rest_base_scores: Vec<f32> = rest.iter().map(|(_, base)| *base).collect();
        let threshold = rescore::adaptive_threshold(
            &rest_base_scores,
            self.config.similarity_threshold,
            self.config.min_similarity_threshold,
            self.config.max_similarity_threshold,
        );

        let mut rest: Vec<SimilarityResult> = rest
            .into_iter()
            .filter(|(result, _)| result.score >= threshold)
            .map(|(result, _)| result)
            .collect();

        rest.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut ranked = exact_matches;
        ranked.extend(rest);
        ranked.truncate(k);
        for (i, result) in ranked.iter_mut().enumerate() {
            result.rank = (i + 1) as u32;
        }

        Ok(ranked)
    }

    /// Embed normalized candidates in sequential batches, each with its own
    /// deadline; batches that fail or time out fall back to deterministic
    /// content-hash embeddings so the pipeline still returns results
    /// (spec.md §4.5 step 3, §5.2).
    async fn embed_all(
        &self,
        normalized: &[(WorkItem, String)],
        request_deadline: Instant,
    ) -> EmbedAllOutcome {
        let batch_size = self.config.embed_batch_size.max(1);
        let batch_deadline = Duration::from_secs(self.config.embed_batch_deadline_seconds);
        let dim = self.embeddings.dimension();

        let mut out = Vec::with_capacity(normalized.len());
        let mut fallback_ids = Vec::new();
        let mut partial = false;
        let mut provider_ever_succeeded = false;

        for chunk in normalized.chunks(batch_size) {
            if Instant::now() >= request_deadline {
                partial = true;
                for (item, text) in chunk {
                    out.push(self.fallback_entry(item, text, dim));
                    fallback_ids.push(item.id);
                }
                continue;
            }

            let texts: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();
            let remaining = request_deadline.saturating_duration_since(Instant::now());
            let effective_deadline = batch_deadline.min(remaining);

            match tokio::time::timeout(effective_deadline, self.embeddings.embed(&texts, effective_deadline)).await
            {
                Ok(Ok(results)) if results.len() == chunk.len() => {
                    for ((item, text), result) in chunk.iter().zip(results.into_iter()) {
                        if result.ok && !result.vector.is_empty() {
                            provider_ever_succeeded = true;
                            out.push(UpsertCandidate {
                                work_item: item.clone(),
                                vector: result.vector,
                                ok: true,
                                source: EmbeddingSourceInfo {
                                    source: EmbeddingSource::Provider,
                                    model: Some(result.model),
                                    tokens: Some(result.tokens),
                                },
                            });
                        } else {
                            out.push(self.fallback_entry(item, text, dim));
                            fallback_ids.push(item.id);
                        }
                    }
                }
                Ok(Ok(_)) => {
                    tracing::warn!("embedding provider returned mismatched batch length; falling back entire batch");
                    for (item, text) in chunk {
                        out.push(self.fallback_entry(item, text, dim));
                        fallback_ids.push(item.id);
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "embedding batch failed; falling back entire batch");
                    for (item, text) in chunk {
                        out.push(self.fallback_entry(item, text, dim));
                        fallback_ids.push(item.id);
                    }
                }
                Err(_) => {
                    tracing::warn!("embedding batch exceeded deadline; falling back entire batch");
                    for (item, text) in chunk {
                        out.push(self.fallback_entry(item, text, dim));
                        fallback_ids.push(item.id);
                    }
                }
            }
        }

        EmbedAllOutcome {
            upsert_candidates: out,
            fallback_ids,
            partial,
            provider_ever_succeeded,
        }
    }

    fn fallback_entry(&self, item: &WorkItem, text: &str, dim: usize) -> UpsertCandidate {
        if !self.config.allow_embedding_hash_fallback {
            return UpsertCandidate {
                work_item: item.clone(),
                vector: Vec::new(),
                ok: false,
                source: EmbeddingSourceInfo {
                    source: EmbeddingSource::HashFallback,
                    model: None,
                    tokens: None,
                },
            };
        }
        let embedding: Embedding = hash_embedding(text, dim);
        UpsertCandidate {
            work_item: item.clone(),
            vector: embedding.values,
            ok: true,
            source: EmbeddingSourceInfo {
                source: EmbeddingSource::HashFallback,
                model: None,
                tokens: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Team;
    use async_trait::async_trait;
    use chrono::Utc;

    fn work_item(id: i64, title: &str) -> WorkItem {
        WorkItem {
            id,
            title: title.to_string(),
            description: format!("A reasonably detailed description for {title} item."),
            acceptance_criteria: String::new(),
            repro_steps: String::new(),
            business_value: String::new(),
            work_item_type: "Bug".to_string(),
            state: "Active".to_string(),
            priority: Some(2),
            area_path: "Proj\\TeamA".to_string(),
            iteration_path: "Proj\\Sprint1".to_string(),
            tags: vec![],
            assigned_to: None,
            created_date: Utc::now(),
            changed_date: Utc::now(),
        }
    }

    struct FixtureTracker {
        items: Vec<WorkItem>,
    }

    #[async_trait]
    impl Tracker for FixtureTracker {
        async fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>> {
            Ok(self.items.iter().find(|w| w.id == id).cloned())
        }

        async fn get_work_items_batch(&self, ids: &[i64]) -> Result<Vec<WorkItem>> {
            Ok(self.items.iter().filter(|w| ids.contains(&w.id)).cloned().collect())
        }

        async fn query_by_structured_query(
            &self,
            query: &crate::domain::StructuredQuery,
        ) -> Result<Vec<i64>> {
            Ok(self.items.iter().filter(|w| w.id != query.exclude_id).map(|w| w.id).collect())
        }

        async fn get_teams(&self, _project: &str) -> Result<Vec<Team>> {
            Ok(vec![Team {
                name: "TeamA".to_string(),
                area_path: Some("Proj\\TeamA".to_string()),
            }])
        }
    }

    /// Scenario E (spec.md §8): a batch that exceeds its deadline falls back
    /// to hash embeddings for that batch's items; the pipeline still returns
    /// results and flags the affected ids in diagnostics.
    struct SlowThenFastEmbeddingProvider {
        dim: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for SlowThenFastEmbeddingProvider {
        async fn embed(&self, texts: &[String], deadline: Duration) -> Result<Vec<crate::collaborators::EmbedResult>> {
            // Always exceeds whatever deadline is handed in, so every batch
            // falls back to the hash embedding. `embed_all` wraps this call
            // in `tokio::time::timeout(effective_deadline, ...)`, so sleeping
            // longer than `deadline` reliably triggers that path.
            tokio::time::sleep(deadline + Duration::from_millis(50)).await;
            Ok(texts
                .iter()
                .map(|_| crate::collaborators::EmbedResult {
                    vector: vec![0.0; self.dim],
                    tokens: 0,
                    model: "slow".to_string(),
                    ok: true,
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dim
        }
    }

    #[tokio::test]
    async fn batch_timeout_falls_back_to_hash_embeddings() {
        let seed = work_item(1, "Fix login button accessibility issue");
        let candidate = work_item(2, "Fix login button accessibility bug");
        let tracker = Arc::new(FixtureTracker {
            items: vec![seed.clone(), candidate.clone()],
        });
        let embeddings = Arc::new(SlowThenFastEmbeddingProvider { dim: 16 });
        let config = Config {
            tracker_slice_spacing_ms: 0,
            embed_batch_deadline_seconds: 0,
            request_deadline_seconds: 5,
            ..Config::default()
        };
        let engine = RelatednessEngine::new(tracker, embeddings, config);

        let response = engine
            .analyze(AnalyzeRequest {
                seed_id: seed.id,
                project: "Proj".to_string(),
                teams: vec!["TeamA".to_string()],
                allowed_types: vec!["Bug".to_string()],
                strategy: Strategy::Balanced,
            })
            .await
            .unwrap();

        assert!(response.diagnostics.embedding_fallback_ids.contains(&candidate.id));
        assert!(response.diagnostics.embedding_fallback_ids.contains(&seed.id));
    }

    /// spec.md §7: a provider that never succeeds, with hash fallback turned
    /// off, surfaces `EmbeddingUnavailable` rather than limping through on
    /// an empty index.
    #[tokio::test]
    async fn provider_down_with_fallback_disabled_returns_embedding_unavailable() {
        let seed = work_item(1, "Fix login button accessibility issue");
        let candidate = work_item(2, "Fix login button accessibility bug");
        let tracker = Arc::new(FixtureTracker {
            items: vec![seed.clone(), candidate],
        });
        let embeddings = Arc::new(SlowThenFastEmbeddingProvider { dim: 16 });
        let config = Config {
            tracker_slice_spacing_ms: 0,
            embed_batch_deadline_seconds: 0,
            request_deadline_seconds: 5,
            allow_embedding_hash_fallback: false,
            ..Config::default()
        };
        let engine = RelatednessEngine::new(tracker, embeddings, config);

        let err = engine
            .analyze(AnalyzeRequest {
                seed_id: seed.id,
                project: "Proj".to_string(),
                teams: vec!["TeamA".to_string()],
                allowed_types: vec!["Bug".to_string()],
                strategy: Strategy::Balanced,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RelatednessError::EmbeddingUnavailable(_)));
    }

    /// Exercises both halves of `find_similar_to_existing_id`: a
    /// near-duplicate title gets promoted to the front at `score = 1.0`
    /// ahead of general rescoring, while a distant, low-similarity neighbor
    /// is dropped by the adaptive threshold that still runs over everyone
    /// else.
    #[tokio::test]
    async fn find_similar_to_existing_id_promotes_exact_match_and_thresholds_the_rest() {
        let anchor = work_item(1, "Fix login button accessibility issue");
        let near_duplicate = work_item(2, "Fix login button accessibility issue");
        let related = work_item(3, "Improve button color contrast for login");
        let unrelated = work_item(4, "Completely unrelated title wording here");

        let dir = tempfile::tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();
        let source = EmbeddingSourceInfo {
            source: EmbeddingSource::Provider,
            model: Some("test".to_string()),
            tokens: Some(0),
        };
        index
            .upsert(vec![
                UpsertCandidate {
                    work_item: anchor.clone(),
                    vector: vec![1.0, 0.0, 0.0],
                    ok: true,
                    source: source.clone(),
                },
                UpsertCandidate {
                    work_item: near_duplicate.clone(),
                    vector: vec![1.0, 0.0, 0.0],
                    ok: true,
                    source: source.clone(),
                },
                UpsertCandidate {
                    work_item: related.clone(),
                    vector: vec![0.95, 0.312, 0.0],
                    ok: true,
                    source: source.clone(),
                },
                UpsertCandidate {
                    work_item: unrelated.clone(),
                    vector: vec![0.0, 1.0, 0.0],
                    ok: true,
                    source,
                },
            ])
            .unwrap();

        let tracker = Arc::new(FixtureTracker { items: vec![anchor.clone()] });
        let embeddings = Arc::new(SlowThenFastEmbeddingProvider { dim: 3 });
        let engine = RelatednessEngine::new(tracker, embeddings, Config::default());

        let ranked = engine.find_similar_to_existing_id(&index, anchor.id, 10).unwrap();

        assert_eq!(ranked[0].work_item_id, near_duplicate.id);
        assert_eq!(ranked[0].score, 1.0);
        assert_eq!(ranked[0].rank, 1);

        assert!(ranked.iter().any(|r| r.work_item_id == related.id));
        assert!(!ranked.iter().any(|r| r.work_item_id == unrelated.id));

        for (i, result) in ranked.iter().enumerate() {
            assert_eq!(result.rank, (i + 1) as u32);
        }
    }
}
