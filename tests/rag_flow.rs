use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use askcampus::embedder::HashingEmbedder;
use askcampus::{
    AnswerOutcome, Chunker, ChunkingConfig, Document, DocumentBatch, Embedder, GenerationError,
    GenerationRequest, Generator, RagConfig, RagError, RagPipeline, RetrievalConfig,
};
use crossbeam_channel::{bounded, Receiver, Sender};

const HOSTEL_TEXT: &str = "LNMIIT offers hostel facilities with round-the-clock security.";

struct CountingGenerator {
    reply: Result<String, GenerationError>,
    calls: AtomicUsize,
}

impl CountingGenerator {
    fn new(reply: Result<String, GenerationError>) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Generator for CountingGenerator {
    fn name(&self) -> &str {
        "counting"
    }

    fn generate(&self, _request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

fn config(dir: &Path) -> RagConfig {
    RagConfig {
        index_dir: dir.to_path_buf(),
        ..RagConfig::default()
    }
}

fn hashing(dims: usize) -> Arc<dyn Embedder> {
    Arc::new(HashingEmbedder::new(dims, 8))
}

fn campus_corpus() -> Vec<DocumentBatch> {
    vec![
        DocumentBatch::new(
            "hostel.json",
            vec![Document::new(
                "hostel",
                "https://lnmiit.ac.in/hostel",
                "Hostel",
                HOSTEL_TEXT,
            )],
        ),
        DocumentBatch::new(
            "academics.json",
            vec![
                Document::new(
                    "library",
                    "https://lnmiit.ac.in/library",
                    "Library",
                    "The central library stays open until midnight during examinations.",
                ),
                Document::new(
                    "fees",
                    "https://lnmiit.ac.in/fees",
                    "Fee structure",
                    "Tuition fees are payable at the start of every semester through the online portal.",
                ),
            ],
        ),
    ]
}

#[test]
fn built_index_serves_a_fresh_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let generator = CountingGenerator::new(Ok(
        "LNMIIT hostels have round-the-clock security [1]. Rooms are shared. Mess food is included. \
         Wardens live on campus. Visitors must sign in."
            .to_string(),
    ));
    let builder = RagPipeline::new(config(dir.path()), hashing(384), generator.clone());
    let report = builder.build_corpus(&campus_corpus()).expect("build");
    assert_eq!(report.batches, 2);
    assert_eq!(report.entries, 3);
    assert_eq!(report.dimensions, 384);

    let server = RagPipeline::new(config(dir.path()), hashing(384), generator.clone());
    server.load().expect("load");

    let results = server.search(HOSTEL_TEXT, 3).expect("search");
    assert_eq!(results[0].rank, 1);
    assert_eq!(results[0].chunk.id, "hostel::chunk_0");
    assert!((results[0].score - 1.0).abs() < 1e-4, "score {}", results[0].score);

    let answer = server.answer_with_top_k("Is the hostel secure?", 1).expect("answer");
    let policy = &server.config().answer;
    assert_eq!(answer.outcome, AnswerOutcome::Generated);
    assert!(!answer.answer.is_empty());
    assert!(answer.answer.split_whitespace().count() <= policy.max_words);
    assert!(askcampus::chunker::split_sentences(&answer.answer).len() <= policy.max_sentences);
    assert!(!answer.answer.contains("Visitors"));
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(generator.calls(), 1);
}

#[test]
fn results_are_ranked_by_descending_score() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = RagPipeline::new(
        config(dir.path()),
        hashing(384),
        CountingGenerator::new(Ok("unused".to_string())),
    );
    pipeline.build_corpus(&campus_corpus()).expect("build");

    let results = pipeline.search("library open during examinations", 10).expect("search");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].chunk.source_id, "library");
    for (i, pair) in results.windows(2).enumerate() {
        assert_eq!(pair[0].rank, i + 1);
        assert!(pair[0].score >= pair[1].score);
    }
    for result in &results {
        assert!(result.score <= 1.0 + 1e-5 && result.score >= -1.0 - 1e-5);
    }
}

#[test]
fn unmatched_query_gets_canned_answer_without_generation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let generator = CountingGenerator::new(Ok("should not be used".to_string()));
    let mut config = config(dir.path());
    config.retrieval = RetrievalConfig {
        min_score: Some(0.5),
        ..RetrievalConfig::default()
    };
    let pipeline = RagPipeline::new(config, hashing(384), generator.clone());
    pipeline.build_corpus(&campus_corpus()).expect("build");

    let answer = pipeline.answer("quantum chromodynamics lecture").expect("answer");
    assert_eq!(answer.outcome, AnswerOutcome::NoResults);
    assert_eq!(
        answer.answer,
        pipeline.config().answer.insufficient_information
    );
    assert!(answer.sources.is_empty());
    assert_eq!(generator.calls(), 0);
}

#[test]
fn rate_limit_becomes_overloaded_answer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let generator = CountingGenerator::new(Err(GenerationError::RateLimited));
    let pipeline = RagPipeline::new(config(dir.path()), hashing(384), generator.clone());
    pipeline.build_corpus(&campus_corpus()).expect("build");

    let answer = pipeline.answer("hostel security").expect("answer");
    assert_eq!(answer.outcome, AnswerOutcome::RateLimited);
    assert_eq!(answer.answer, pipeline.config().answer.overloaded);
    assert!(answer.sources.is_empty());
    assert_eq!(generator.calls(), 1);
}

#[test]
fn query_dimension_mismatch_is_structural() {
    let dir = tempfile::tempdir().expect("tempdir");
    let generator = CountingGenerator::new(Ok("unused".to_string()));
    let builder = RagPipeline::new(config(dir.path()), hashing(64), generator.clone());
    builder.build_corpus(&campus_corpus()).expect("build");

    let server = RagPipeline::new(config(dir.path()), hashing(32), generator.clone());
    server.load().expect("load");
    match server.answer("hostel") {
        Err(RagError::Schema { expected, actual }) => {
            assert_eq!(expected, 64);
            assert_eq!(actual, 32);
        }
        other => panic!("expected schema error, got {other:?}"),
    }
    assert_eq!(generator.calls(), 0);
}

#[test]
fn rechunking_is_idempotent() {
    let chunker = Chunker::new(ChunkingConfig {
        chunk_size: 60,
        min_chunk_size: 10,
        ..ChunkingConfig::default()
    });
    let document = Document::new(
        "policy",
        "https://lnmiit.ac.in/policy",
        "Policy",
        "<p>Attendance is mandatory.</p><p>Leave needs approval from the warden. \
         Late returns are reported to parents.</p><script>track()</script>",
    );
    let first = chunker.normalize_and_chunk(&document);
    let second = chunker.normalize_and_chunk(&document);
    assert!(first.len() > 1);
    let view = |chunks: &[askcampus::Chunk]| {
        chunks
            .iter()
            .map(|chunk| (chunk.id.clone(), chunk.content.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(view(&first), view(&second));
    for chunk in &first {
        assert!(!chunk.content.contains('<'));
        assert!(!chunk.content.contains("track()"));
        assert!(chunk.content_length <= 60);
    }
}

/// Blocks its first batch until released so a build can be held open.
struct GatedEmbedder {
    inner: HashingEmbedder,
    gated: AtomicBool,
    started: Sender<()>,
    release: Receiver<()>,
}

impl Embedder for GatedEmbedder {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    fn embed_batch(&self, inputs: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        if self.gated.swap(false, Ordering::SeqCst) {
            let _ = self.started.send(());
            let _ = self.release.recv();
        }
        self.inner.embed_batch(inputs)
    }
}

#[test]
fn concurrent_build_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let embedder = Arc::new(GatedEmbedder {
        inner: HashingEmbedder::new(64, 8),
        gated: AtomicBool::new(true),
        started: started_tx,
        release: release_rx,
    });
    let pipeline = Arc::new(RagPipeline::new(
        config(dir.path()),
        embedder,
        CountingGenerator::new(Ok("unused".to_string())),
    ));

    let first = {
        let pipeline = pipeline.clone();
        thread::spawn(move || pipeline.build_corpus(&campus_corpus()))
    };
    started_rx.recv().expect("first build started");
    assert!(matches!(
        pipeline.build_corpus(&campus_corpus()),
        Err(RagError::BuildInProgress)
    ));
    release_tx.send(()).expect("release");

    let report = first.join().expect("join").expect("first build");
    assert_eq!(report.entries, 3);
    assert!(pipeline.is_ready());
}
