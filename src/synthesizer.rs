//! Grounded answer synthesis over retrieved chunks.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunker::{collapse_whitespace, split_sentences};
use crate::config::{AnswerPolicy, GenerationConfig, RetrievalConfig};
use crate::generation::{GenerationError, GenerationRequest, Generator};
use crate::index::RetrievalResult;

const CONTEXT_PLACEHOLDER: &str = " ...";

/// How an answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOutcome {
    /// The generation backend answered from retrieved context.
    Generated,
    /// Retrieval found nothing; canned answer, generator not called.
    NoResults,
    /// The generation backend was rate limited; canned answer.
    RateLimited,
    /// Generation failed or returned nothing; answer describes the error.
    GenerationFailed,
    /// The query could not be embedded; answer describes the error.
    RetrievalFailed,
}

impl AnswerOutcome {
    /// True for every outcome other than [`AnswerOutcome::Generated`].
    pub fn is_fallback(self) -> bool {
        self != Self::Generated
    }
}

/// One cited source, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAttribution {
    /// 1-based rank.
    pub rank: usize,
    /// Cosine similarity.
    pub score: f32,
    /// Source title.
    pub title: String,
    /// Source URL.
    pub url: String,
}

/// Final answer handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedAnswer {
    /// Question as asked.
    pub query: String,
    /// Policy-bounded answer text.
    pub answer: String,
    /// Sources used for the answer; empty for every fallback.
    pub sources: Vec<SourceAttribution>,
    /// How the answer was produced.
    pub outcome: AnswerOutcome,
}

/// Turns ranked chunks into a bounded, grounded answer.
pub struct AnswerSynthesizer {
    policy: AnswerPolicy,
    system_prompt: String,
    context_width: usize,
    temperature: f32,
    max_tokens: usize,
    generator: Arc<dyn Generator>,
}

impl AnswerSynthesizer {
    /// Builds a synthesizer around a generation backend.
    pub fn new(
        policy: AnswerPolicy,
        retrieval: &RetrievalConfig,
        generation: &GenerationConfig,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            system_prompt: policy.system_prompt(),
            policy,
            context_width: retrieval.context_chunk_width,
            temperature: generation.temperature,
            max_tokens: generation.max_output_tokens,
            generator,
        }
    }

    /// Active answer policy.
    pub fn policy(&self) -> &AnswerPolicy {
        &self.policy
    }

    /// Answers `query` from `results`, which must already be in rank order.
    ///
    /// Never fails: backend problems become canned or error-describing answers.
    pub fn synthesize(&self, query: &str, results: &[RetrievalResult]) -> GeneratedAnswer {
        if results.is_empty() {
            info!("no retrieval results; returning canned answer");
            return self.fallback(
                query,
                AnswerOutcome::NoResults,
                &self.policy.insufficient_information,
            );
        }

        let prompt = build_prompt(query, &build_context(results, self.context_width));
        let request = GenerationRequest {
            system: &self.system_prompt,
            prompt: &prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let started = Instant::now();
        let raw = self.generator.generate(&request);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match raw {
            Ok(text) if !text.trim().is_empty() => {
                debug!(
                    provider = self.generator.name(),
                    elapsed_ms,
                    raw_chars = text.len(),
                    "generation complete"
                );
                GeneratedAnswer {
                    query: query.to_string(),
                    answer: self.enforce(&text),
                    sources: attributions(results),
                    outcome: AnswerOutcome::Generated,
                }
            }
            Ok(_) => {
                warn!(provider = self.generator.name(), elapsed_ms, "generation returned no text");
                self.fallback(
                    query,
                    AnswerOutcome::GenerationFailed,
                    "Sorry, the answer service returned an empty response.",
                )
            }
            Err(GenerationError::RateLimited) => {
                warn!(provider = self.generator.name(), elapsed_ms, "generation rate limited");
                self.fallback(query, AnswerOutcome::RateLimited, &self.policy.overloaded)
            }
            Err(err) => {
                warn!(provider = self.generator.name(), elapsed_ms, error = %err, "generation failed");
                self.fallback(
                    query,
                    AnswerOutcome::GenerationFailed,
                    &format!("Sorry, I couldn't generate an answer: {err}"),
                )
            }
        }
    }

    /// Answer used when the query itself could not be embedded.
    pub fn retrieval_failed(&self, query: &str, reason: &str) -> GeneratedAnswer {
        warn!(error = reason, "query embedding failed");
        self.fallback(
            query,
            AnswerOutcome::RetrievalFailed,
            &format!("Sorry, I couldn't search my sources right now: {reason}"),
        )
    }

    /// Applies the sentence and word caps.
    pub fn enforce(&self, text: &str) -> String {
        enforce_output_policy(
            text,
            self.policy.max_sentences,
            self.policy.max_words,
            &self.policy.truncation_marker,
        )
    }

    fn fallback(&self, query: &str, outcome: AnswerOutcome, text: &str) -> GeneratedAnswer {
        GeneratedAnswer {
            query: query.to_string(),
            answer: self.enforce(text),
            sources: Vec::new(),
            outcome,
        }
    }
}

fn attributions(results: &[RetrievalResult]) -> Vec<SourceAttribution> {
    results
        .iter()
        .map(|result| SourceAttribution {
            rank: result.rank,
            score: result.score,
            title: result.chunk.title.clone(),
            url: result.chunk.url.clone(),
        })
        .collect()
}

/// Numbered source blocks, one per result, each body shortened to `width` chars.
pub fn build_context(results: &[RetrievalResult], width: usize) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let chunk = &result.chunk;
            let label = if chunk.title.trim().is_empty() {
                chunk.url.as_str()
            } else {
                chunk.title.as_str()
            };
            format!(
                "[{}] {}\n{}\n{}",
                i + 1,
                label,
                chunk.url,
                shorten(&chunk.content, width, CONTEXT_PLACEHOLDER)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// User turn sent alongside the system policy.
pub fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "User question: {query}\n\nRelevant sources:\n{context}\n\n\
         Answer clearly, cite sources, and keep the answer concise."
    )
}

/// Collapses whitespace and, when the result is wider than `width` chars, keeps
/// whole leading words followed by `placeholder` within the width.
pub fn shorten(text: &str, width: usize, placeholder: &str) -> String {
    let collapsed = collapse_whitespace(text);
    if collapsed.chars().count() <= width {
        return collapsed;
    }
    let budget = width.saturating_sub(placeholder.chars().count());
    let mut out = String::new();
    let mut used = 0usize;
    for word in collapsed.split(' ') {
        let word_len = word.chars().count();
        let needed = if out.is_empty() { word_len } else { used + 1 + word_len };
        if needed > budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
        used = needed;
    }
    if out.is_empty() {
        out = collapsed.chars().take(budget).collect();
    }
    out.push_str(placeholder);
    out
}

/// Keeps the first `max_sentences` sentences, then the first `max_words`
/// words, appending `marker` to the last kept word when words were dropped.
pub fn enforce_output_policy(
    text: &str,
    max_sentences: usize,
    max_words: usize,
    marker: &str,
) -> String {
    let collapsed = collapse_whitespace(text);
    let kept = split_sentences(&collapsed)
        .into_iter()
        .take(max_sentences)
        .collect::<Vec<_>>()
        .join(" ");
    let words: Vec<&str> = kept.split_whitespace().collect();
    if words.len() <= max_words {
        return kept;
    }
    let mut out = words[..max_words].join(" ");
    out.push_str(marker);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedGenerator {
        reply: Result<String, GenerationError>,
        calls: AtomicUsize,
        last_prompt: Mutex<String>,
    }

    impl ScriptedGenerator {
        fn new(reply: Result<String, GenerationError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }
    }

    impl Generator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().expect("prompt lock") = request.prompt.to_string();
            self.reply.clone()
        }
    }

    fn synthesizer(generator: Arc<ScriptedGenerator>) -> AnswerSynthesizer {
        AnswerSynthesizer::new(
            AnswerPolicy::default(),
            &RetrievalConfig::default(),
            &GenerationConfig::default(),
            generator,
        )
    }

    fn result(rank: usize, score: f32, title: &str, content: &str) -> RetrievalResult {
        RetrievalResult {
            rank,
            score,
            chunk: Chunk {
                id: format!("doc::chunk_{rank}"),
                source_id: "doc".to_string(),
                chunk_index: rank,
                content: content.to_string(),
                content_length: content.chars().count(),
                title: title.to_string(),
                url: format!("https://lnmiit.ac.in/{rank}"),
                source_type: "html".to_string(),
                processed_at: 0,
            },
        }
    }

    fn sentence_count(text: &str) -> usize {
        split_sentences(text).len()
    }

    #[test]
    fn no_results_skips_generation() {
        let generator = ScriptedGenerator::new(Ok("unused".to_string()));
        let answer = synthesizer(generator.clone()).synthesize("hostel fees?", &[]);
        assert_eq!(answer.outcome, AnswerOutcome::NoResults);
        assert_eq!(answer.answer, AnswerPolicy::default().insufficient_information);
        assert!(answer.sources.is_empty());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn generated_answer_is_capped_and_attributed() {
        let long = "First point [1]. Second point. Third point. Fourth point. Fifth point. Sixth.";
        let generator = ScriptedGenerator::new(Ok(long.to_string()));
        let results = vec![
            result(1, 0.9, "Hostels", "Hostels are secure."),
            result(2, 0.5, "", "Mess timings."),
        ];
        let answer = synthesizer(generator.clone()).synthesize("hostel?", &results);
        assert_eq!(answer.outcome, AnswerOutcome::Generated);
        assert_eq!(
            answer.answer,
            "First point [1]. Second point. Third point. Fourth point."
        );
        assert_eq!(answer.sources.len(), 2);
        assert_eq!(answer.sources[0].rank, 1);
        assert_eq!(answer.sources[1].url, "https://lnmiit.ac.in/2");

        let prompt = generator.last_prompt.lock().expect("prompt lock").clone();
        assert!(prompt.starts_with("User question: hostel?"));
        assert!(prompt.contains("[1] Hostels\nhttps://lnmiit.ac.in/1\nHostels are secure."));
        assert!(prompt.contains("[2] https://lnmiit.ac.in/2\nhttps://lnmiit.ac.in/2\nMess timings."));
    }

    #[test]
    fn rate_limit_maps_to_overloaded_answer() {
        let generator = ScriptedGenerator::new(Err(GenerationError::RateLimited));
        let answer = synthesizer(generator).synthesize("q", &[result(1, 0.8, "t", "c")]);
        assert_eq!(answer.outcome, AnswerOutcome::RateLimited);
        assert_eq!(answer.answer, AnswerPolicy::default().overloaded);
        assert!(answer.sources.is_empty());
    }

    #[test]
    fn failures_describe_the_error() {
        let generator = ScriptedGenerator::new(Err(GenerationError::Timeout));
        let answer = synthesizer(generator).synthesize("q", &[result(1, 0.8, "t", "c")]);
        assert_eq!(answer.outcome, AnswerOutcome::GenerationFailed);
        assert!(answer.answer.contains("timed out"), "{}", answer.answer);

        let generator = ScriptedGenerator::new(Ok("   ".to_string()));
        let answer = synthesizer(generator).synthesize("q", &[result(1, 0.8, "t", "c")]);
        assert_eq!(answer.outcome, AnswerOutcome::GenerationFailed);
        assert!(answer.sources.is_empty());
    }

    #[test]
    fn word_cap_appends_marker() {
        let text = (1..=100).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let capped = enforce_output_policy(&text, 4, 80, "...");
        let words: Vec<_> = capped.split_whitespace().collect();
        assert_eq!(words.len(), 80);
        assert_eq!(words[79], "w80...");
        assert!(sentence_count(&capped) <= 4);
    }

    #[test]
    fn policy_holds_for_awkward_input() {
        let inputs = [
            "",
            "No punctuation at all but plenty of words here",
            "A.\n\nB!   C?\tD. E. F.",
            "Ellipsis... then more. And more! Done?",
        ];
        for input in inputs {
            let capped = enforce_output_policy(input, 2, 5, "...");
            assert!(sentence_count(&capped) <= 2, "{capped:?}");
            assert!(capped.split_whitespace().count() <= 5, "{capped:?}");
        }
    }

    #[test]
    fn shorten_cuts_on_word_boundaries() {
        assert_eq!(shorten("  short   text ", 20, " ..."), "short text");
        let cut = shorten("alpha beta gamma delta epsilon", 20, " ...");
        assert_eq!(cut, "alpha beta gamma ...");
        assert!(cut.chars().count() <= 20);
        assert_eq!(shorten("abcdefghijklmnop", 10, " ..."), "abcdef ...");
    }

    #[test]
    fn retrieval_failure_is_an_answer() {
        let generator = ScriptedGenerator::new(Ok("unused".to_string()));
        let answer = synthesizer(generator.clone()).retrieval_failed("q", "embedding service down");
        assert_eq!(answer.outcome, AnswerOutcome::RetrievalFailed);
        assert!(answer.answer.contains("embedding service down"));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }
}
