use anyhow::{bail, Context, Result};
use askcampus::{init_tracing, ConfigArgs, GeneratedAnswer, RagPipeline, RetrievalResult};
use clap::Parser;

const PREVIEW_CHARS: usize = 400;

#[derive(Parser, Debug)]
#[command(
    name = "askcampus-ask",
    about = "Answer a question (or just list matching chunks) from the askcampus index"
)]
struct AskCli {
    /// Question to answer
    #[arg(required = true, num_args = 1..)]
    query: Vec<String>,

    /// Print ranked chunks without calling the generation provider
    #[arg(long, default_value_t = false)]
    search_only: bool,

    /// Override the configured number of chunks
    #[arg(long)]
    top_k: Option<usize>,

    /// Emit JSON instead of plain text
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = AskCli::parse();
    let query = cli.query.join(" ");
    if query.trim().is_empty() {
        bail!("query text must not be empty");
    }
    let config = cli.config.build_config();
    let top_k = cli.top_k.unwrap_or(config.retrieval.top_k);

    let pipeline = if cli.search_only {
        RagPipeline::retrieval_only(config)?
    } else {
        RagPipeline::from_config(config)?
    };
    pipeline.load().context("failed to load index")?;

    if cli.search_only {
        let results = pipeline.search(&query, top_k)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&results)?);
        } else {
            print_results(&results);
        }
        return Ok(());
    }

    let answer = pipeline.answer_with_top_k(&query, top_k)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        print_answer(&answer);
    }
    Ok(())
}

fn print_results(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("no matching chunks");
        return;
    }
    for result in results {
        let chunk = &result.chunk;
        println!(
            "[{:.4}] {} - {}",
            result.score,
            display_title(&chunk.title, &chunk.url),
            chunk.url
        );
        println!("{}\n", preview(&chunk.content, PREVIEW_CHARS));
    }
}

fn print_answer(answer: &GeneratedAnswer) {
    println!("--- Answer ---\n{}", answer.answer);
    if answer.sources.is_empty() {
        return;
    }
    println!("\n--- Sources ---");
    for source in &answer.sources {
        println!(
            "[{}] {} - {} (score={:.4})",
            source.rank,
            display_title(&source.title, &source.url),
            source.url,
            source.score
        );
    }
}

fn display_title<'a>(title: &'a str, url: &'a str) -> &'a str {
    if title.trim().is_empty() {
        url
    } else {
        title
    }
}

fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_cuts_on_char_boundary() {
        assert_eq!(preview("héllo world", 5), "héllo...");
        assert_eq!(preview("short", 400), "short");
    }

    #[test]
    fn untitled_chunks_show_their_url() {
        assert_eq!(display_title("  ", "https://lnmiit.ac.in"), "https://lnmiit.ac.in");
        assert_eq!(display_title("Hostel", "https://lnmiit.ac.in"), "Hostel");
    }

    #[test]
    fn query_words_are_joined() {
        let cli = AskCli::parse_from(["askcampus-ask", "--search-only", "hostel", "fees"]);
        assert!(cli.search_only);
        assert_eq!(cli.query.join(" "), "hostel fees");
    }
}
