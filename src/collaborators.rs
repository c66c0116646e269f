//! Abstract external collaborators (spec.md §6). The core consumes these
//! traits; it never implements a tracker client, an embedding model, or an
//! LLM. Production wiring lives outside this crate — only in-memory mocks
//! for tests live here and under `#[cfg(test)]` in the integration suite.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{StructuredQuery, Team, WorkItem};
use crate::error::Result;

/// `GetWorkItem`, `GetWorkItemsBatch`, `QueryByStructuredQuery`, `GetTeams`
/// (spec.md §6).
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>>;

    /// `ids.len() <= 200`, per spec.md §4.2 step 6 / §6.
    async fn get_work_items_batch(&self, ids: &[i64]) -> Result<Vec<WorkItem>>;

    /// Returns matching ids, newest-first, per spec.md §4.2 step 4.
    async fn query_by_structured_query(&self, query: &StructuredQuery) -> Result<Vec<i64>>;

    async fn get_teams(&self, project: &str) -> Result<Vec<Team>>;
}

/// Result of embedding one text, per spec.md §6: `ok=false` entries carry an
/// empty vector and the caller falls back to a hash embedding for them.
#[derive(Debug, Clone)]
pub struct EmbedResult {
    pub vector: Vec<f32>,
    pub tokens: i64,
    pub model: String,
    pub ok: bool,
}

/// `Embed(texts[<=25], deadline) -> [EmbedResult]`, length-preserving
/// (spec.md §6).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String], deadline: Duration) -> Result<Vec<EmbedResult>>;

    /// The dimension this provider's vectors use. Exposed so the index and
    /// the hash fallback can agree on `D` without embedding an actual call.
    fn dimension(&self) -> usize;
}

/// A typed relationship edge inferred between two work items (spec.md §6).
#[derive(Debug, Clone)]
pub struct RelationshipEdge {
    pub from_id: i64,
    pub to_id: i64,
    pub relationship_type: String,
    pub confidence: f32,
}

/// `Infer(pairs, deadline) -> [RelationshipEdge]` — optional, consumed only
/// by downstream callers that request relationship typing (spec.md §6). The
/// core never calls this itself.
#[async_trait]
pub trait LlmRelationship: Send + Sync {
    async fn infer(
        &self,
        pairs: &[(i64, i64)],
        deadline: Duration,
    ) -> Result<Vec<RelationshipEdge>>;
}
