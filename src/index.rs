//! Embedding index: build, search and the serving pointer.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunker::Chunk;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::similarity::{normalize, FlatInnerProduct, SimilarityBackend};

/// Ranked hit returned by [`VectorIndex::search`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// 1-based rank.
    pub rank: usize,
    /// Cosine similarity with the query.
    pub score: f32,
    /// Matched chunk and its denormalized metadata.
    pub chunk: Chunk,
}

/// Immutable, searchable index. Chunk `i` owns vector `i` in the backend.
pub struct VectorIndex {
    model: String,
    chunks: Vec<Chunk>,
    backend: Box<dyn SimilarityBackend>,
    built_at_ms: u64,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("model", &self.model)
            .field("entries", &self.chunks.len())
            .field("dimensions", &self.dimensions())
            .field("built_at_ms", &self.built_at_ms)
            .finish()
    }
}

impl VectorIndex {
    /// Pairs chunks with a populated backend.
    pub fn new(
        model: impl Into<String>,
        chunks: Vec<Chunk>,
        backend: Box<dyn SimilarityBackend>,
        built_at_ms: u64,
    ) -> Result<Self> {
        if chunks.len() != backend.len() {
            return Err(RagError::CorruptIndex(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                backend.len()
            )));
        }
        Ok(Self {
            model: model.into(),
            chunks,
            backend,
            built_at_ms,
        })
    }

    /// Embedding model the vectors came from.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Vector dimension fixed at build time.
    pub fn dimensions(&self) -> usize {
        self.backend.dimensions()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk records in insertion order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Stored unit vector for entry `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        self.backend.row(position)
    }

    /// Build timestamp in milliseconds since epoch.
    pub fn built_at_ms(&self) -> u64 {
        self.built_at_ms
    }

    /// Ranks entries against a unit-length query vector.
    ///
    /// A query of the wrong dimension fails with [`RagError::Schema`] before any
    /// scoring happens.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<RetrievalResult>> {
        if query.len() != self.dimensions() {
            return Err(RagError::Schema {
                expected: self.dimensions(),
                actual: query.len(),
            });
        }
        let hits = self.backend.search(query, top_k);
        Ok(hits
            .into_iter()
            .enumerate()
            .filter_map(|(i, hit)| {
                self.chunks.get(hit.position).map(|chunk| RetrievalResult {
                    rank: i + 1,
                    score: hit.score,
                    chunk: chunk.clone(),
                })
            })
            .collect())
    }
}

/// Embeds chunks in batches and assembles a [`VectorIndex`].
pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    workers: usize,
    expected_dims: Option<usize>,
}

impl IndexBuilder {
    /// Creates a builder; the batch size is capped by the embedder's own limit.
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1).min(embedder.batch_size().max(1));
        Self {
            embedder,
            batch_size,
            workers: 1,
            expected_dims: None,
        }
    }

    /// Number of concurrent embedding workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Dimension every vector must have; otherwise adopted from the first batch.
    pub fn expected_dimensions(mut self, dims: Option<usize>) -> Self {
        self.expected_dims = dims;
        self
    }

    /// Embeds every chunk and returns the finished index.
    ///
    /// All or nothing: any batch failure, dimension disagreement or zero vector
    /// aborts the build.
    pub fn build(&self, chunks: Vec<Chunk>) -> Result<VectorIndex> {
        if chunks.is_empty() {
            return Err(RagError::EmptyCorpus);
        }
        let started = Instant::now();
        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.content.as_str()).collect();
        let batches: Vec<&[&str]> = texts.chunks(self.batch_size).collect();
        info!(
            chunks = chunks.len(),
            batches = batches.len(),
            batch_size = self.batch_size,
            workers = self.workers,
            "embedding corpus"
        );
        let embedded = if self.workers <= 1 || batches.len() <= 1 {
            self.embed_sequential(&batches)?
        } else {
            self.embed_parallel(&batches)?
        };
        if embedded.len() != chunks.len() {
            return Err(RagError::Embedding(format!(
                "embedder returned {} vectors for {} chunks",
                embedded.len(),
                chunks.len()
            )));
        }

        let dims = self
            .expected_dims
            .unwrap_or_else(|| embedded.first().map(Vec::len).unwrap_or(0));
        if dims == 0 {
            return Err(RagError::Embedding("embedder returned empty vectors".into()));
        }
        let mut backend = FlatInnerProduct::new(dims);
        for (chunk, mut vector) in chunks.iter().zip(embedded) {
            if vector.len() != dims {
                return Err(RagError::Schema {
                    expected: dims,
                    actual: vector.len(),
                });
            }
            if !normalize(&mut vector) {
                return Err(RagError::Embedding(format!(
                    "chunk {} embedded to a zero-norm vector",
                    chunk.id
                )));
            }
            backend.push(&vector);
        }
        info!(
            entries = chunks.len(),
            dims,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index built"
        );
        VectorIndex::new(
            self.embedder.model(),
            chunks,
            Box::new(backend),
            epoch_ms(),
        )
    }

    fn embed_sequential(&self, batches: &[&[&str]]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::new();
        for (batch_id, batch) in batches.iter().enumerate() {
            vectors.extend(embed_checked(self.embedder.as_ref(), batch_id, batch)?);
            debug!(batch = batch_id, total = batches.len(), "embedded batch");
        }
        Ok(vectors)
    }

    /// Fans batches out to worker threads and reassembles them in dispatch order.
    fn embed_parallel(&self, batches: &[&[&str]]) -> Result<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_ref();
        let (task_tx, task_rx) = bounded::<EmbeddingTask<'_>>(self.workers * 2);
        let (result_tx, result_rx) = bounded::<EmbeddingResult>(self.workers * 2);

        thread::scope(|scope| {
            for worker_id in 0..self.workers {
                let worker_rx = task_rx.clone();
                let worker_tx = result_tx.clone();
                scope.spawn(move || worker_loop(worker_id, worker_rx, worker_tx, embedder));
            }
            drop(task_rx);
            drop(result_tx);

            scope.spawn(move || {
                for (id, inputs) in batches.iter().enumerate() {
                    if task_tx.send(EmbeddingTask { id, inputs }).is_err() {
                        break;
                    }
                }
            });

            let outcome = collect_in_order(&result_rx, batches.len());
            // Unblocks workers still sending after an early failure.
            drop(result_rx);
            outcome
        })
    }
}

fn collect_in_order(result_rx: &Receiver<EmbeddingResult>, total: usize) -> Result<Vec<Vec<f32>>> {
    let mut pending: BTreeMap<usize, Vec<Vec<f32>>> = BTreeMap::new();
    let mut ordered = Vec::new();
    let mut next_id = 0usize;
    while next_id < total {
        let batch = match result_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                debug!(waiting_on = next_id, "still waiting on embedding batches");
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(RagError::Embedding(
                    "embedding worker channel closed unexpectedly".into(),
                ))
            }
        };
        pending.insert(batch.id, batch.vectors);
        while let Some(vectors) = pending.remove(&next_id) {
            ordered.extend(vectors);
            next_id += 1;
        }
    }
    Ok(ordered)
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<EmbeddingTask<'_>>,
    sender: Sender<EmbeddingResult>,
    embedder: &dyn Embedder,
) {
    for task in receiver.iter() {
        let result = embed_checked(embedder, task.id, task.inputs).map(|vectors| {
            debug!(worker = worker_id, batch = task.id, "embedded batch");
            EmbeddedBatch {
                id: task.id,
                vectors,
            }
        });
        if let Err(err) = &result {
            warn!(worker = worker_id, batch = task.id, error = %err, "embedding batch failed");
        }
        if sender.send(result).is_err() {
            break;
        }
    }
}

fn embed_checked(embedder: &dyn Embedder, batch_id: usize, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder
        .embed_batch(inputs)
        .map_err(|err| RagError::Embedding(format!("batch {batch_id}: {err:#}")))?;
    if vectors.len() != inputs.len() {
        return Err(RagError::Embedding(format!(
            "batch {batch_id}: {} vectors for {} inputs",
            vectors.len(),
            inputs.len()
        )));
    }
    Ok(vectors)
}

struct EmbeddingTask<'a> {
    id: usize,
    inputs: &'a [&'a str],
}

struct EmbeddedBatch {
    id: usize,
    vectors: Vec<Vec<f32>>,
}

type EmbeddingResult = Result<EmbeddedBatch>;

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

/// Serving pointer to the live index.
///
/// Readers take an `Arc` snapshot and keep using it even if a rebuild swaps a
/// new index in underneath them.
#[derive(Default)]
pub struct IndexHandle {
    current: RwLock<Option<Arc<VectorIndex>>>,
}

impl IndexHandle {
    /// Empty handle; [`IndexHandle::snapshot`] fails until something is swapped in.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once an index has been installed.
    pub fn is_ready(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Current index, or [`RagError::IndexNotReady`].
    pub fn snapshot(&self) -> Result<Arc<VectorIndex>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RagError::IndexNotReady)
    }

    /// Installs `index`, returning the one it replaced.
    pub fn swap(&self, index: Arc<VectorIndex>) -> Option<Arc<VectorIndex>> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        guard.replace(index)
    }
}
