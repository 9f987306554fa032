//! Deterministic hash embedder backing the reference engine.
//!
//! Every vector is derived from a SipHash of the model seed and the input, so
//! the same model always maps the same input to the same unit vector.
use std::hash::{DefaultHasher, Hash, Hasher};

use super::{Embedder, EmbedderError, l2_normalize};

/// Produces deterministic, L2-normalized vectors from input hashes.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
    seed: u64,
}

impl HashEmbedder {
    /// Create a new `HashEmbedder` with the given dimensionality.
    ///
    /// `seed` separates models: two embedders with different seeds produce
    /// unrelated vectors for the same input.
    #[must_use]
    pub fn new(dimensions: usize, seed: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        Self {
            dimensions,
            seed: hasher.finish(),
        }
    }

    fn vector_from(&self, domain: u8, input: &[u8]) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        domain.hash(&mut hasher);
        input.hash(&mut hasher);
        let mut state = hasher.finish();

        let mut embedding = Vec::with_capacity(self.dimensions);
        for _ in 0..self.dimensions {
            let bits = splitmix64(&mut state);
            // Top 24 bits mapped onto [-1, 1).
            let unit = (bits >> 40) as f32 / (1u64 << 24) as f32;
            embedding.push(unit * 2.0 - 1.0);
        }

        l2_normalize(&mut embedding);
        embedding
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384, "default")
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        Ok(self.vector_from(b't', text.as_bytes()))
    }

    fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbedderError> {
        if bytes.is_empty() {
            return Err(EmbedderError::Unsupported("empty binary input".to_string()));
        }
        Ok(self.vector_from(b'b', bytes))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
