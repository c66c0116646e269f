//! Relatedness Core: finds work items semantically related to a seed work
//! item, returning a ranked, explained list (spec.md §1).
//!
//! Five components compose the pipeline, dependency order leaves first:
//! [`phrase`] (C1), [`fetch`] (C2), [`text`] (C3), [`index`] (C4), and
//! [`engine`] (C5), which drives a request end-to-end. [`collaborators`]
//! holds the abstract external interfaces (tracker, embedding provider, LLM
//! relationship inference) this crate consumes but never implements.

pub mod collaborators;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod hash_embedding;
pub mod index;
pub mod phrase;
pub mod text;

pub use collaborators::{EmbeddingProvider, EmbedResult, LlmRelationship, Tracker};
pub use config::Config;
pub use domain::{
    CanonicalText, Diagnostics, Embedding, IndexRecord, Phrase, SimilarityResult, Strategy,
    WorkItem,
};
pub use engine::{AnalyzeRequest, AnalyzeResponse, RelatednessEngine};
pub use error::{RelatednessError, Result};
pub use index::EmbeddingIndex;
