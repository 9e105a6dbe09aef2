#![warn(missing_docs)]
//! Retrieval-augmented question answering over a crawled campus corpus.
//!
//! Offline, [`RagPipeline::build_corpus`] chunks raw documents, embeds the
//! chunks and persists a new index generation. Online, [`RagPipeline::answer`]
//! embeds the question, ranks chunks by cosine similarity and asks a
//! generation backend for a short, cited answer.

pub mod chunker;
pub mod config;
pub mod document;
pub mod embedder;
pub mod error;
pub mod generation;
pub mod index;
pub mod pipeline;
pub mod similarity;
pub mod store;
pub mod synthesizer;

pub use chunker::{Chunk, ChunkReport, Chunker};
pub use config::{
    AnswerPolicy, ChunkingConfig, ChunkingPolicy, ConfigArgs, EmbeddingBackend, EmbeddingConfig,
    GenerationConfig, LlmProvider, RagConfig, RetrievalConfig,
};
pub use document::{load_dir, load_file, Document, DocumentBatch, MalformedEntry, MalformedReason};
pub use embedder::Embedder;
pub use error::{RagError, Result};
pub use generation::{GenerationError, GenerationRequest, Generator};
pub use index::{IndexBuilder, IndexHandle, RetrievalResult, VectorIndex};
pub use pipeline::{BuildReport, RagPipeline};
pub use similarity::{FlatInnerProduct, SimilarityBackend};
pub use store::{IndexManifest, IndexStore};
pub use synthesizer::{AnswerOutcome, AnswerSynthesizer, GeneratedAnswer, SourceAttribution};

/// Installs the `tracing` subscriber used by the binaries.
///
/// Honors `RUST_LOG`, defaulting to `askcampus=info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("askcampus=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
