//! Process-wide context wiring chunking, indexing and synthesis together.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::chunker::{Chunk, ChunkReport, Chunker};
use crate::config::RagConfig;
use crate::document::DocumentBatch;
use crate::embedder::{self, Embedder};
use crate::error::{RagError, Result};
use crate::generation::{self, Disabled, Generator};
use crate::index::{IndexBuilder, IndexHandle, RetrievalResult, VectorIndex};
use crate::similarity::normalize;
use crate::store::IndexStore;
use crate::synthesizer::{AnswerSynthesizer, GeneratedAnswer};

/// Summary of one `build_corpus` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    /// Input batches (files).
    pub batches: usize,
    /// Documents that yielded at least one chunk.
    pub documents: usize,
    /// Chunks emitted after dedup.
    pub chunks: usize,
    /// Chunks dropped as duplicates.
    pub duplicates: usize,
    /// Chunks dropped for holding no letters or digits.
    pub no_text: usize,
    /// Malformed entries skipped.
    pub skipped: usize,
    /// Entries in the new index (equals `chunks`).
    pub entries: usize,
    /// Vector dimension of the new index.
    pub dimensions: usize,
    /// Generation directory now in service; `None` when nothing was built.
    pub generation: Option<PathBuf>,
    /// Wall-clock build time.
    pub elapsed_ms: u64,
}

/// Initialization context shared by every request.
///
/// Built once at startup; `answer` only reads, `build_corpus` is serialized
/// by an internal lock and swaps the serving index when it succeeds.
pub struct RagPipeline {
    config: RagConfig,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    synthesizer: AnswerSynthesizer,
    store: IndexStore,
    handle: IndexHandle,
    build_lock: Mutex<()>,
}

impl RagPipeline {
    /// Wires a pipeline from explicit capabilities; nothing is loaded yet.
    pub fn new(
        config: RagConfig,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let synthesizer = AnswerSynthesizer::new(
            config.answer.clone(),
            &config.retrieval,
            &config.generation,
            generator,
        );
        Self {
            chunker: Chunker::new(config.chunking.clone()),
            store: IndexStore::new(config.index_dir.clone()),
            embedder,
            synthesizer,
            handle: IndexHandle::new(),
            build_lock: Mutex::new(()),
            config,
        }
    }

    /// Builds the configured embedding and generation clients.
    pub fn from_config(config: RagConfig) -> anyhow::Result<Self> {
        let embedder = embedder::from_config(&config.embedding)?;
        let generator = generation::from_config(&config.generation)?;
        Ok(Self::new(config, embedder, generator))
    }

    /// Like [`RagPipeline::from_config`] without a generation client, for
    /// indexing and search-only use.
    pub fn retrieval_only(config: RagConfig) -> anyhow::Result<Self> {
        let embedder = embedder::from_config(&config.embedding)?;
        Ok(Self::new(config, embedder, Arc::new(Disabled)))
    }

    /// Active configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Chunker built from the configuration.
    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Persistent store backing the index.
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// True once an index is in service.
    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    /// Snapshot of the serving index.
    pub fn index(&self) -> Result<Arc<VectorIndex>> {
        self.handle.snapshot()
    }

    /// Loads the persisted index into service.
    pub fn load(&self) -> Result<()> {
        let (index, manifest) = self.store.load()?;
        if manifest.model != self.embedder.model() {
            warn!(
                index_model = %manifest.model,
                embedder_model = self.embedder.model(),
                "index was built with a different embedding model"
            );
        }
        info!(
            entries = index.len(),
            dims = index.dimensions(),
            "index loaded"
        );
        self.handle.swap(Arc::new(index));
        Ok(())
    }

    /// Chunks, embeds and persists a whole corpus, then swaps it into service.
    ///
    /// A corpus without chunks leaves the current index untouched. Any
    /// embedding failure aborts before anything is persisted.
    pub fn build_corpus(&self, batches: &[DocumentBatch]) -> Result<BuildReport> {
        self.build_chunked(self.chunk_corpus(batches))
    }

    /// Chunks every batch, one report per batch in input order.
    pub fn chunk_corpus(&self, batches: &[DocumentBatch]) -> Vec<ChunkReport> {
        self.chunker.chunk_batches(batches)
    }

    /// Embeds and persists chunks produced by [`RagPipeline::chunk_corpus`],
    /// then swaps the new index into service.
    pub fn build_chunked(&self, reports: Vec<ChunkReport>) -> Result<BuildReport> {
        let _guard = match self.build_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(RagError::BuildInProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let started = Instant::now();
        let batches = reports.len();
        let mut chunked = ChunkReport::default();
        for batch in reports {
            chunked.merge(batch);
        }
        let mut report = report_for(batches, &chunked);
        if chunked.chunks.is_empty() {
            warn!(
                batches,
                skipped = report.skipped,
                "corpus produced zero chunks; keeping the existing index"
            );
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let index = self.build_index(chunked.chunks)?;
        let generation = self.store.save(&index, &self.config.chunking)?;
        report.entries = index.len();
        report.dimensions = index.dimensions();
        report.generation = Some(generation);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.handle.swap(Arc::new(index));
        info!(
            entries = report.entries,
            dims = report.dimensions,
            elapsed_ms = report.elapsed_ms,
            "corpus build complete"
        );
        Ok(report)
    }

    fn build_index(&self, chunks: Vec<Chunk>) -> Result<VectorIndex> {
        IndexBuilder::new(self.embedder.clone(), self.config.embedding.batch_size)
            .workers(self.config.embedding.worker_threads)
            .expected_dimensions(self.config.embedding.dimensions)
            .build(chunks)
    }

    /// Ranked chunks for `query` without generation.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>> {
        let index = self.handle.snapshot()?;
        let vector = self.embed_query(&index, query)?.map_err(RagError::Embedding)?;
        self.rank(&index, &vector, top_k)
    }

    /// Answers `query` with the configured top-k.
    pub fn answer(&self, query: &str) -> Result<GeneratedAnswer> {
        self.answer_with_top_k(query, self.config.retrieval.top_k)
    }

    /// Answers `query` from the `top_k` best chunks.
    ///
    /// Only [`RagError::IndexNotReady`] and [`RagError::Schema`] are returned as
    /// errors; every other failure becomes answer text.
    pub fn answer_with_top_k(&self, query: &str, top_k: usize) -> Result<GeneratedAnswer> {
        let started = Instant::now();
        let index = self.handle.snapshot()?;
        let vector = match self.embed_query(&index, query)? {
            Ok(vector) => vector,
            Err(reason) => return Ok(self.synthesizer.retrieval_failed(query, &reason)),
        };
        let results = self.rank(&index, &vector, top_k)?;
        let answer = self.synthesizer.synthesize(query, &results);
        info!(
            outcome = ?answer.outcome,
            results = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answered query"
        );
        Ok(answer)
    }

    /// Embeds and normalizes a query. The outer error is structural; the inner
    /// one is a recoverable embedding failure.
    fn embed_query(
        &self,
        index: &VectorIndex,
        query: &str,
    ) -> Result<std::result::Result<Vec<f32>, String>> {
        let mut vector = match self.embedder.embed_one(query) {
            Ok(vector) => vector,
            Err(err) => return Ok(Err(format!("{err:#}"))),
        };
        if vector.len() != index.dimensions() {
            return Err(RagError::Schema {
                expected: index.dimensions(),
                actual: vector.len(),
            });
        }
        if !normalize(&mut vector) {
            return Ok(Err("query embedded to a zero-norm vector".to_string()));
        }
        Ok(Ok(vector))
    }

    fn rank(
        &self,
        index: &VectorIndex,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let mut results = index.search(vector, top_k)?;
        if let Some(min_score) = self.config.retrieval.min_score {
            results.retain(|result| result.score >= min_score);
        }
        Ok(results)
    }
}

fn report_for(batches: usize, chunked: &ChunkReport) -> BuildReport {
    BuildReport {
        batches,
        documents: chunked.documents,
        chunks: chunked.chunks.len(),
        duplicates: chunked.duplicates,
        no_text: chunked.no_text,
        skipped: chunked.skipped(),
        ..BuildReport::default()
    }
}
