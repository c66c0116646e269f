//! Configuration loaded from environment variables (SPEC_FULL.md §10).
//!
//! Follows the teacher's `Config::from_env` shape: read a named env var,
//! fall back to a documented default, parse. No presets — unlike the
//! teacher's `OperatingMode`, there is no in-process model whose thread/permit
//! counts need tuning (embedding inference is an external collaborator,
//! spec.md §6), so that axis of configuration has nothing left to control.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// C4 index directory (`VECTOR_DB_PATH`).
    pub vector_db_path: PathBuf,
    /// Configured default fed into the adaptive threshold, spec.md §4.5 step 8.
    pub similarity_threshold: f32,
    pub min_similarity_threshold: f32,
    pub max_similarity_threshold: f32,
    /// C5 embedding batching, spec.md §5.2.
    pub embed_batch_size: usize,
    pub embed_batch_deadline_seconds: u64,
    /// C2 balanced-strategy short-circuit ceiling, spec.md §4.2 step 5.
    pub balanced_result_cap: usize,
    /// Open Question resolution: see DESIGN.md.
    pub allow_embedding_hash_fallback: bool,
    /// C3 bounds, spec.md §4.3.
    pub max_text_length: usize,
    pub min_text_length: usize,
    /// Final result count requested from `analyze`.
    pub top_k: usize,
    /// §5.1 inter-slice delay.
    pub tracker_slice_spacing_ms: u64,
    /// Overall request deadline, §5 "Cancellation & timeouts".
    pub request_deadline_seconds: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            vector_db_path: PathBuf::from(
                env::var("VECTOR_DB_PATH").unwrap_or_else(|_| ".relatedness/index".to_string()),
            ),
            similarity_threshold: env::var("SIMILARITY_THRESHOLD")
                .unwrap_or_else(|_| "0.65".to_string())
                .parse()?,
            min_similarity_threshold: env::var("MIN_SIMILARITY_THRESHOLD")
                .unwrap_or_else(|_| "0.60".to_string())
                .parse()?,
            max_similarity_threshold: env::var("MAX_SIMILARITY_THRESHOLD")
                .unwrap_or_else(|_| "0.95".to_string())
                .parse()?,
            embed_batch_size: env::var("EMBED_BATCH_SIZE")
                .unwrap_or_else(|_| "25".to_string())
                .parse()?,
            embed_batch_deadline_seconds: env::var("EMBED_BATCH_DEADLINE_SECONDS")
                .unwrap_or_else(|_| "45".to_string())
                .parse()?,
            balanced_result_cap: env::var("BALANCED_RESULT_CAP")
                .unwrap_or_else(|_| "350".to_string())
                .parse()?,
            allow_embedding_hash_fallback: env::var("ALLOW_EMBEDDING_HASH_FALLBACK")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),
            max_text_length: env::var("MAX_TEXT_LENGTH")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()?,
            min_text_length: env::var("MIN_TEXT_LENGTH")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            top_k: env::var("TOP_K").unwrap_or_else(|_| "20".to_string()).parse()?,
            tracker_slice_spacing_ms: env::var("TRACKER_SLICE_SPACING_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,
            request_deadline_seconds: env::var("REQUEST_DEADLINE_SECONDS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vector_db_path: PathBuf::from(".relatedness/index"),
            similarity_threshold: 0.65,
            min_similarity_threshold: 0.60,
            max_similarity_threshold: 0.95,
            embed_batch_size: 25,
            embed_batch_deadline_seconds: 45,
            balanced_result_cap: 350,
            allow_embedding_hash_fallback: true,
            max_text_length: 8000,
            min_text_length: 10,
            top_k: 20,
            tracker_slice_spacing_ms: 500,
            request_deadline_seconds: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.embed_batch_size, 25);
        assert_eq!(cfg.embed_batch_deadline_seconds, 45);
        assert_eq!(cfg.balanced_result_cap, 350);
        assert!((cfg.similarity_threshold - 0.65).abs() < 1e-9);
        assert!((cfg.min_similarity_threshold - 0.60).abs() < 1e-9);
        assert!((cfg.max_similarity_threshold - 0.95).abs() < 1e-9);
    }
}
