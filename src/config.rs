//! Runtime configuration shared by the indexer, the CLI and the HTTP API.

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Chunking policy applied to a single document.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkingPolicy {
    /// Greedy sentence accumulation bounded by the target size.
    Sentence,
    /// Fixed-width windows advancing by `size - overlap`.
    SlidingWindow,
}

/// Chunker tuning knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Target (maximum) chunk size `S` in characters.
    pub chunk_size: usize,
    /// Minimum chunk size `M` in characters.
    pub min_chunk_size: usize,
    /// Sliding-window overlap `O` in characters.
    pub overlap: usize,
    /// Number of leading characters `H` used as the dedup key.
    pub dedup_prefix: usize,
    /// Source types chunked with the sliding window instead of sentences.
    pub window_source_types: Vec<String>,
}

impl ChunkingConfig {
    /// Picks the chunking policy for a document's source type.
    pub fn policy_for(&self, source_type: &str) -> ChunkingPolicy {
        let source_type = source_type.trim();
        if self
            .window_source_types
            .iter()
            .any(|kind| kind.eq_ignore_ascii_case(source_type))
        {
            ChunkingPolicy::SlidingWindow
        } else {
            ChunkingPolicy::Sentence
        }
    }

    /// Overlap clamped so that windows always advance.
    pub fn effective_overlap(&self) -> usize {
        self.overlap.min(self.chunk_size.saturating_sub(1))
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            min_chunk_size: 200,
            overlap: 200,
            dedup_prefix: 200,
            window_source_types: vec!["pdf".to_string(), "raw".to_string()],
        }
    }
}

/// Embedding capability selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum EmbeddingBackend {
    /// OpenAI-compatible `/embeddings` endpoint.
    Openai,
    /// Qdrant Cloud Inference endpoint.
    Qdrant,
    /// Offline token-hashing embedder.
    Hashing,
}

/// Embedding client settings.
#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    /// Selected backend.
    pub backend: EmbeddingBackend,
    /// Model identifier passed to the backend.
    pub model: String,
    /// Expected vector dimension; `None` adopts whatever the first batch returns.
    pub dimensions: Option<usize>,
    /// Base URL (OpenAI) or full inference endpoint (Qdrant).
    pub endpoint: String,
    /// API key for remote backends.
    pub api_key: Option<String>,
    /// Inputs per embedding request.
    pub batch_size: usize,
    /// Concurrent embedding workers during build.
    pub worker_threads: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry attempts for transient failures.
    pub max_retries: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Openai,
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            batch_size: 64,
            worker_threads: 1,
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Retrieval and context assembly settings.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalConfig {
    /// Default number of chunks retrieved per query.
    pub top_k: usize,
    /// Hits scoring below this cosine similarity are discarded; `None` keeps all.
    pub min_score: Option<f32>,
    /// Per-chunk character width inside the assembled context.
    pub context_chunk_width: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: None,
            context_chunk_width: 1500,
        }
    }
}

/// Fixed system policy and output caps for synthesized answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnswerPolicy {
    /// Who the assistant is.
    pub persona: String,
    /// Grounding instruction.
    pub grounding_rule: String,
    /// Citation requirement.
    pub citation_rule: String,
    /// Instruction used when the sources do not support an answer.
    pub unknown_rule: String,
    /// Sentence cap `N`.
    pub max_sentences: usize,
    /// Word cap `W`.
    pub max_words: usize,
    /// Marker appended when the word cap truncates the answer.
    pub truncation_marker: String,
    /// Canned answer when retrieval returns nothing.
    pub insufficient_information: String,
    /// Canned answer when the generation backend is rate limited.
    pub overloaded: String,
}

impl AnswerPolicy {
    /// Renders the system policy text sent with every generation request.
    pub fn system_prompt(&self) -> String {
        format!(
            "{} {} {} {} Answer in at most {} sentences and {} words.",
            self.persona,
            self.grounding_rule,
            self.citation_rule,
            self.unknown_rule,
            self.max_sentences,
            self.max_words
        )
    }
}

impl Default for AnswerPolicy {
    fn default() -> Self {
        Self {
            persona: "You are a concise and accurate assistant for LNMIIT.".to_string(),
            grounding_rule: "Use only the retrieved sources to answer the question and do not invent facts that are not in them.".to_string(),
            citation_rule: "Cite the source numbers [1], [2], etc. after factual statements.".to_string(),
            unknown_rule: "If the answer isn't supported by the sources, say you don't know.".to_string(),
            max_sentences: 4,
            max_words: 80,
            truncation_marker: "...".to_string(),
            insufficient_information:
                "I don't have enough information in my sources to answer that question.".to_string(),
            overloaded: "The answer service is overloaded right now. Please retry in a moment."
                .to_string(),
        }
    }
}

/// Generation provider selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LlmProvider {
    /// OpenAI chat completions.
    Openai,
    /// Anthropic messages API.
    Anthropic,
    /// Google Gemini `generateContent`.
    Gemini,
}

/// Generation client settings.
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    /// Selected provider.
    pub provider: LlmProvider,
    /// Model identifier.
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Output token budget.
    pub max_output_tokens: usize,
    /// Request timeout for a single generation call.
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Gemini,
            model: "gemini-2.5-flash".to_string(),
            api_key: None,
            temperature: 0.0,
            max_output_tokens: 512,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Complete configuration tree, built once at startup.
#[derive(Clone, Debug)]
pub struct RagConfig {
    /// Root directory holding index generations.
    pub index_dir: PathBuf,
    /// Chunker settings.
    pub chunking: ChunkingConfig,
    /// Embedding settings.
    pub embedding: EmbeddingConfig,
    /// Retrieval settings.
    pub retrieval: RetrievalConfig,
    /// Answer policy.
    pub answer: AnswerPolicy,
    /// Generation settings.
    pub generation: GenerationConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("data/index"),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            answer: AnswerPolicy::default(),
            generation: GenerationConfig::default(),
        }
    }
}

/// Environment/flag surface flattened into every binary.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Directory holding index generations
    #[arg(long, env = "ASKCAMPUS_INDEX_DIR", default_value = "data/index")]
    pub index_dir: PathBuf,

    /// Target chunk size in characters
    #[arg(long, env = "ASKCAMPUS_CHUNK_SIZE", default_value_t = 2000)]
    pub chunk_size: usize,

    /// Minimum chunk size in characters
    #[arg(long, env = "ASKCAMPUS_MIN_CHUNK_SIZE", default_value_t = 200)]
    pub min_chunk_size: usize,

    /// Sliding-window overlap in characters
    #[arg(long, env = "ASKCAMPUS_CHUNK_OVERLAP", default_value_t = 200)]
    pub chunk_overlap: usize,

    /// Leading characters compared when dropping duplicate chunks
    #[arg(long, env = "ASKCAMPUS_DEDUP_PREFIX", default_value_t = 200)]
    pub dedup_prefix: usize,

    /// Source types chunked with the sliding window, comma separated
    #[arg(long, env = "ASKCAMPUS_WINDOW_SOURCE_TYPES", default_value = "pdf,raw")]
    pub window_source_types: String,

    /// Embedding backend
    #[arg(long, env = "ASKCAMPUS_EMBEDDING_BACKEND", value_enum, default_value = "openai")]
    pub embedding_backend: EmbeddingBackend,

    /// Embedding model identifier
    #[arg(
        long,
        env = "ASKCAMPUS_EMBEDDING_MODEL",
        default_value = "text-embedding-3-small"
    )]
    pub embedding_model: String,

    /// Expected embedding dimension (also requested from backends that support it)
    #[arg(long, env = "ASKCAMPUS_EMBEDDING_DIMENSIONS")]
    pub embedding_dimensions: Option<usize>,

    /// Embedding endpoint (OpenAI base URL or Qdrant inference URL)
    #[arg(
        long,
        env = "ASKCAMPUS_EMBEDDING_ENDPOINT",
        default_value = "https://api.openai.com/v1"
    )]
    pub embedding_endpoint: String,

    /// API key for the embedding backend
    #[arg(long, env = "ASKCAMPUS_EMBEDDING_API_KEY")]
    pub embedding_api_key: Option<String>,

    /// Max inputs per embedding request
    #[arg(long, env = "ASKCAMPUS_EMBEDDING_BATCH", default_value_t = 64)]
    pub embedding_batch_size: usize,

    /// Concurrent embedding workers during builds
    #[arg(long, env = "ASKCAMPUS_EMBEDDING_THREADS", default_value_t = 1)]
    pub embedding_threads: usize,

    /// Seconds before an embedding request times out
    #[arg(long, env = "ASKCAMPUS_EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,

    /// Retry attempts for transient embedding failures
    #[arg(long, env = "ASKCAMPUS_EMBEDDING_MAX_RETRIES", default_value_t = 3)]
    pub embedding_max_retries: usize,

    /// Chunks retrieved per query
    #[arg(long, env = "ASKCAMPUS_TOP_K", default_value_t = 5)]
    pub top_k: usize,

    /// Discard hits scoring below this similarity
    #[arg(long, env = "ASKCAMPUS_MIN_SCORE")]
    pub min_score: Option<f32>,

    /// Characters kept from each chunk in the prompt context
    #[arg(long, env = "ASKCAMPUS_CONTEXT_WIDTH", default_value_t = 1500)]
    pub context_chunk_width: usize,

    /// Maximum sentences in an answer
    #[arg(long, env = "ASKCAMPUS_MAX_SENTENCES", default_value_t = 4)]
    pub max_sentences: usize,

    /// Maximum words in an answer
    #[arg(long, env = "ASKCAMPUS_MAX_WORDS", default_value_t = 80)]
    pub max_words: usize,

    /// Generation provider
    #[arg(long, env = "ASKCAMPUS_LLM_PROVIDER", value_enum, default_value = "gemini")]
    pub llm_provider: LlmProvider,

    /// Generation model identifier
    #[arg(long, env = "ASKCAMPUS_LLM_MODEL", default_value = "gemini-2.5-flash")]
    pub llm_model: String,

    /// API key for the generation provider
    #[arg(long, env = "ASKCAMPUS_LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// Sampling temperature
    #[arg(long, env = "ASKCAMPUS_TEMPERATURE", default_value_t = 0.0)]
    pub temperature: f32,

    /// Output token budget per answer
    #[arg(long, env = "ASKCAMPUS_MAX_OUTPUT_TOKENS", default_value_t = 512)]
    pub max_output_tokens: usize,

    /// Seconds before a generation request times out
    #[arg(long, env = "ASKCAMPUS_GENERATION_TIMEOUT_SECS", default_value_t = 30)]
    pub generation_timeout_secs: u64,
}

impl ConfigArgs {
    /// Converts parsed flags into a [`RagConfig`].
    pub fn build_config(&self) -> RagConfig {
        let chunk_size = self.chunk_size.max(1);
        let chunking = ChunkingConfig {
            chunk_size,
            min_chunk_size: self.min_chunk_size.min(chunk_size.saturating_sub(1)),
            overlap: self.chunk_overlap.min(chunk_size.saturating_sub(1)),
            dedup_prefix: self.dedup_prefix.max(1),
            window_source_types: split_list(&self.window_source_types),
        };
        let embedding = EmbeddingConfig {
            backend: self.embedding_backend,
            model: self.embedding_model.clone(),
            dimensions: self.embedding_dimensions.filter(|dims| *dims > 0),
            endpoint: self.embedding_endpoint.clone(),
            api_key: self.embedding_api_key.clone().filter(|key| !key.trim().is_empty()),
            batch_size: self.embedding_batch_size.max(1),
            worker_threads: self.embedding_threads.max(1),
            timeout: Duration::from_secs(self.embedding_timeout_secs.max(1)),
            max_retries: self.embedding_max_retries.max(1),
        };
        let retrieval = RetrievalConfig {
            top_k: self.top_k.max(1),
            min_score: self.min_score.filter(|score| score.is_finite()),
            context_chunk_width: self.context_chunk_width.max(16),
        };
        let answer = AnswerPolicy {
            max_sentences: self.max_sentences.max(1),
            max_words: self.max_words.max(1),
            ..AnswerPolicy::default()
        };
        let generation = GenerationConfig {
            provider: self.llm_provider,
            model: self.llm_model.clone(),
            api_key: self.llm_api_key.clone().filter(|key| !key.trim().is_empty()),
            temperature: self.temperature.clamp(0.0, 2.0),
            max_output_tokens: self.max_output_tokens.max(1),
            timeout: Duration::from_secs(self.generation_timeout_secs.max(1)),
        };
        RagConfig {
            index_dir: self.index_dir.clone(),
            chunking,
            embedding,
            retrieval,
            answer,
            generation,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn defaults_match_documented_values() {
        let harness = Harness::parse_from(["test"]);
        let config = harness.config.build_config();
        assert_eq!(config.chunking.chunk_size, 2000);
        assert_eq!(config.chunking.min_chunk_size, 200);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.min_score, None);
        assert_eq!(config.answer.max_sentences, 4);
        assert_eq!(config.answer.max_words, 80);
        assert_eq!(config.generation.max_output_tokens, 512);
    }

    #[test]
    fn clamps_degenerate_values() {
        let harness = Harness::parse_from([
            "test",
            "--chunk-size",
            "100",
            "--chunk-overlap",
            "500",
            "--top-k",
            "0",
            "--embedding-batch-size",
            "0",
        ]);
        let config = harness.config.build_config();
        assert_eq!(config.chunking.overlap, 99);
        assert_eq!(config.chunking.min_chunk_size, 99);
        assert_eq!(config.retrieval.top_k, 1);
        assert_eq!(config.embedding.batch_size, 1);
    }

    #[test]
    fn window_policy_follows_source_type() {
        let config = ChunkingConfig::default();
        assert_eq!(config.policy_for("PDF"), ChunkingPolicy::SlidingWindow);
        assert_eq!(config.policy_for("html"), ChunkingPolicy::Sentence);
        assert_eq!(config.policy_for(""), ChunkingPolicy::Sentence);
    }

    #[test]
    fn system_prompt_mentions_caps() {
        let policy = AnswerPolicy::default();
        let prompt = policy.system_prompt();
        assert!(prompt.contains("at most 4 sentences and 80 words"));
        assert!(prompt.contains("do not invent facts"));
    }
}
