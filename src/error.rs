//! Error taxonomy shared by the build and query paths.

use thiserror::Error;

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Structural failures that callers must branch on.
///
/// Conditions that degrade into answer text (no results, rate limits, generation
/// failures) are modelled as [`crate::synthesizer::AnswerOutcome`] values instead.
#[derive(Debug, Error)]
pub enum RagError {
    /// `search` or `answer` was called before an index was loaded or built.
    #[error("embedding index is not loaded")]
    IndexNotReady,
    /// A vector did not match the dimension recorded at build time.
    #[error("embedding dimension mismatch: index expects {expected}, got {actual}")]
    Schema {
        /// Dimension recorded in the index.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },
    /// A build was requested with no chunks to index.
    #[error("corpus produced zero chunks; existing index left untouched")]
    EmptyCorpus,
    /// Another build currently holds the build lock.
    #[error("an index build is already running")]
    BuildInProgress,
    /// The embedding capability failed or returned unusable vectors.
    #[error("embedding failed: {0}")]
    Embedding(String),
    /// Persisted index files are inconsistent with their manifest.
    #[error("index on disk is corrupt: {0}")]
    CorruptIndex(String),
    /// Filesystem failure while persisting or loading.
    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),
    /// Sidecar or manifest (de)serialization failure.
    #[error("index serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
