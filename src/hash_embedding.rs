//! Deterministic content-hash fallback embedding (spec.md §4.5 step 3, §9
//! Open Questions). Used when the external embedding provider times out or
//! fails entirely, so the pipeline still returns *something* instead of
//! hard-failing.
//!
//! Grounded on `original_source/SemanticSimilarity/openarena_embeddings.py`'s
//! `_generate_hash_based_embeddings` / `_hash_to_vector`: repeatedly hash the
//! text with a running counter to fill out `D` components, then L2-normalize.
//! This crate uses SHA-256 (already a dependency for other purposes) in place
//! of the original's implementation, producing a different but equally
//! deterministic and equally non-semantic vector — acceptable since the
//! fallback's only contract is determinism (identical text -> identical
//! vector) and unit length, not fidelity to any particular hash construction.

use sha2::{Digest, Sha256};

use crate::domain::Embedding;

/// Produce a deterministic unit vector of dimension `dim` from `text`. Two
/// calls with the same `(text, dim)` always produce the same vector
/// (Scenario A in spec.md §8 relies on this: seed and a perfect duplicate
/// candidate must hash to equal vectors).
pub fn hash_embedding(text: &str, dim: usize) -> Embedding {
    let mut values = Vec::with_capacity(dim);
    let mut counter: u32 = 0;

    while values.len() < dim {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();

        for chunk in digest.chunks_exact(4) {
            if values.len() >= dim {
                break;
            }
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // Map into [-1.0, 1.0) before normalization.
            let component = (raw as f64 / u32::MAX as f64) * 2.0 - 1.0;
            values.push(component as f32);
        }
        counter += 1;
    }

    Embedding::normalized(values).unwrap_or_else(|| {
        // A content-hash vector is vanishingly unlikely to be all-zero; if it
        // ever is, fall back to a fixed unit basis vector rather than panic.
        let mut basis = vec![0.0f32; dim];
        if dim > 0 {
            basis[0] = 1.0;
        }
        Embedding::from_unit_vector(basis)
    })
}
