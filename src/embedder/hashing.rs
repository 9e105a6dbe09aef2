//! Offline embedder based on signed token feature hashing.

use anyhow::Result;

use super::{check_batch, Embedder};

pub(super) const DEFAULT_DIMENSIONS: usize = 384;

/// Deterministic bag-of-words embedder for tests and air-gapped indexing.
///
/// Lowercased alphanumeric tokens are hashed with CRC32 into `dimensions`
/// buckets with a hash-derived sign. Adjacent token pairs add a half-weight
/// feature so word order carries a little signal. Text without tokens maps to
/// the zero vector.
#[derive(Clone, Debug)]
pub struct HashingEmbedder {
    dimensions: usize,
    batch_size: usize,
    model: String,
}

impl HashingEmbedder {
    /// Creates an embedder producing `dimensions`-wide vectors.
    pub fn new(dimensions: usize, batch_size: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            batch_size: batch_size.max(1),
            model: format!("hashing-{dimensions}"),
        }
    }

    /// Output dimension.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens: Vec<String> = text
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
            .collect();
        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, joined.as_bytes(), 0.5);
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], bytes: &[u8], weight: f32) {
        let hash = crc32fast::hash(bytes);
        let bucket = (hash as usize) % self.dimensions;
        let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        check_batch(inputs, self.batch_size)?;
        Ok(inputs.iter().map(|text| self.embed_text(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_same_vector() {
        let embedder = HashingEmbedder::new(64, 8);
        let a = embedder.embed_one("Hostel rooms are allotted in July.").expect("embed");
        let b = embedder.embed_one("hostel ROOMS are allotted in july").expect("embed");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16, 8);
        let vector = embedder.embed_one(" ... ").expect("embed");
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn model_name_encodes_dimension() {
        assert_eq!(HashingEmbedder::new(128, 4).model(), "hashing-128");
        assert_eq!(HashingEmbedder::new(0, 0).dimensions(), 1);
    }
}
