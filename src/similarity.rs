//! Vector math and the exact inner-product search backend.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// L2-normalizes `v` in place. Returns `false` (leaving `v` untouched) when the
/// norm is zero or not finite.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}

/// Dot product. On unit vectors this is the cosine similarity.
pub fn dot_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scored hit produced by a [`SimilarityBackend`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Insertion position of the matched vector.
    pub position: usize,
    /// Inner product with the query.
    pub score: f32,
}

/// Nearest-neighbour search over unit vectors.
///
/// Implementations rank by descending inner product and break ties by
/// insertion order.
pub trait SimilarityBackend: Send + Sync {
    /// Vector dimension accepted by the backend.
    fn dimensions(&self) -> usize;
    /// Number of stored vectors.
    fn len(&self) -> usize;
    /// True when no vectors are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Stored vector at `position`, used when persisting.
    fn row(&self, position: usize) -> Option<&[f32]>;
    /// Returns up to `top_k` hits, best first.
    fn search(&self, query: &[f32], top_k: usize) -> Vec<Hit>;
}

/// Exhaustive inner-product scan over a contiguous row-major buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatInnerProduct {
    dims: usize,
    data: Vec<f32>,
}

impl FlatInnerProduct {
    /// Creates an empty backend for `dims`-wide vectors.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    /// Wraps an existing row-major buffer. `data.len()` must be a multiple of `dims`.
    pub fn from_raw(dims: usize, data: Vec<f32>) -> Option<Self> {
        if dims == 0 || data.len() % dims != 0 {
            return None;
        }
        Some(Self { dims, data })
    }

    /// Appends one vector; callers check the dimension first.
    pub fn push(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dims);
        self.data.extend_from_slice(vector);
    }

    /// Raw row-major values.
    pub fn as_raw(&self) -> &[f32] {
        &self.data
    }
}

impl SimilarityBackend for FlatInnerProduct {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    fn row(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dims)?;
        self.data.get(start..start.checked_add(self.dims)?)
    }

    fn search(&self, query: &[f32], top_k: usize) -> Vec<Hit> {
        if top_k == 0 || self.dims == 0 {
            return Vec::new();
        }
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(top_k + 1);
        for (position, row) in self.data.chunks_exact(self.dims).enumerate() {
            let score = dot_similarity(query, row);
            if !score.is_finite() {
                continue;
            }
            heap.push(HeapEntry { score, position });
            if heap.len() > top_k {
                heap.pop();
            }
        }
        let mut hits: Vec<Hit> = heap
            .into_iter()
            .map(|entry| Hit {
                position: entry.position,
                score: entry.score,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.position.cmp(&b.position))
        });
        hits
    }
}

/// Heap entry ordered so the worst hit (lowest score, then latest position) sits on top.
#[derive(Debug)]
struct HeapEntry {
    score: f32,
    position: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.position.cmp(&other.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(rows: &[[f32; 2]]) -> FlatInnerProduct {
        let mut flat = FlatInnerProduct::new(2);
        for row in rows {
            flat.push(row);
        }
        flat
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        assert!(normalize(&mut v));
        assert!((dot_similarity(&v, &v) - 1.0).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        assert!(!normalize(&mut zero));
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn search_ranks_descending() {
        let flat = backend(&[[1.0, 0.0], [0.0, 1.0], [0.6, 0.8]]);
        let hits = flat.search(&[0.0, 1.0], 3);
        let order: Vec<_> = hits.iter().map(|h| h.position).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn ties_keep_insertion_order() {
        let flat = backend(&[[0.0, 1.0], [1.0, 0.0], [1.0, 0.0], [1.0, 0.0]]);
        let hits = flat.search(&[1.0, 0.0], 2);
        let order: Vec<_> = hits.iter().map(|h| h.position).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn top_k_bounds_results() {
        let flat = backend(&[[1.0, 0.0], [0.0, 1.0]]);
        assert!(flat.search(&[1.0, 0.0], 0).is_empty());
        assert_eq!(flat.search(&[1.0, 0.0], 10).len(), 2);
        assert!(FlatInnerProduct::new(2).search(&[1.0, 0.0], 3).is_empty());
    }

    #[test]
    fn raw_buffer_must_be_whole_rows() {
        assert!(FlatInnerProduct::from_raw(2, vec![1.0, 2.0, 3.0]).is_none());
        let flat = FlatInnerProduct::from_raw(2, vec![1.0, 0.0, 0.0, 1.0]).expect("rows");
        assert_eq!(flat.len(), 2);
        assert_eq!(flat.row(1), Some(&[0.0, 1.0][..]));
        assert_eq!(flat.row(2), None);
    }
}
