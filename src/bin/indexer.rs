use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use askcampus::{init_tracing, load_dir, load_file, ChunkReport, ConfigArgs, DocumentBatch, RagPipeline};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "askcampus-index",
    about = "Chunk raw crawl output, embed it and publish a new index generation"
)]
struct IndexCli {
    /// Raw corpus file or directory of .json/.jsonl files
    #[arg(long, env = "ASKCAMPUS_INPUT", default_value = "data/raw")]
    input: PathBuf,

    /// Optional directory receiving the cleaned chunks of every input file
    #[arg(long, env = "ASKCAMPUS_PROCESSED_DIR")]
    processed_dir: Option<PathBuf>,

    /// Print the build report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = IndexCli::parse();
    let batches = load_input(&cli.input)?;
    if batches.is_empty() {
        bail!("no corpus files found under {}", cli.input.display());
    }

    let pipeline = RagPipeline::retrieval_only(cli.config.build_config())?;
    let chunked = pipeline.chunk_corpus(&batches);
    if let Some(dir) = &cli.processed_dir {
        write_processed(&batches, &chunked, dir)?;
    }

    let report = pipeline.build_chunked(chunked)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    match &report.generation {
        Some(generation) => println!(
            "indexed {} chunks from {} documents ({} batches, {} duplicates, {} without text, {} skipped) into {} [dims={}, {} ms]",
            report.entries,
            report.documents,
            report.batches,
            report.duplicates,
            report.no_text,
            report.skipped,
            generation.display(),
            report.dimensions,
            report.elapsed_ms
        ),
        None => println!(
            "no chunks produced from {} batches ({} skipped); existing index left in place",
            report.batches, report.skipped
        ),
    }
    Ok(())
}

fn load_input(input: &Path) -> Result<Vec<DocumentBatch>> {
    if input.is_dir() {
        load_dir(input)
    } else {
        Ok(vec![load_file(input)?])
    }
}

/// Writes each batch's chunks, exactly as they will be indexed.
fn write_processed(batches: &[DocumentBatch], reports: &[ChunkReport], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    for (batch, report) in batches.iter().zip(reports) {
        let path = dir.join(processed_name(&batch.name));
        let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report.chunks)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(file = %path.display(), chunks = report.chunks.len(), "wrote processed chunks");
    }
    Ok(())
}

/// `hostel.jsonl` becomes `hostel_processed.json`.
fn processed_name(batch_name: &str) -> String {
    let stem = Path::new(batch_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| batch_name.to_string());
    format!("{stem}_processed.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use askcampus::{Chunker, ChunkingConfig, Document};

    #[test]
    fn processed_files_are_named_after_their_input() {
        assert_eq!(processed_name("hostel.jsonl"), "hostel_processed.json");
        assert_eq!(processed_name("fees"), "fees_processed.json");
    }

    #[test]
    fn processed_chunks_are_written_per_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let batch = DocumentBatch::new(
            "hostel.json",
            vec![Document::new(
                "hostel",
                "https://lnmiit.ac.in/hostel",
                "Hostel",
                "LNMIIT offers hostel facilities with round-the-clock security.",
            )],
        );
        let batches = vec![batch];
        let reports = Chunker::new(ChunkingConfig::default()).chunk_batches(&batches);
        write_processed(&batches, &reports, dir.path()).expect("write");

        let raw = fs::read_to_string(dir.path().join("hostel_processed.json")).expect("read");
        let chunks: Vec<askcampus::Chunk> = serde_json::from_str(&raw).expect("parse");
        assert_eq!(chunks, reports[0].chunks);
        assert_eq!(chunks[0].id, "hostel::chunk_0");
    }

    #[test]
    fn single_file_input_is_one_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fees.json");
        fs::write(
            &path,
            r#"[{"id":"fees","url":"https://lnmiit.ac.in/fees","title":"Fees","text":"Tuition is due each semester."}]"#,
        )
        .expect("write");
        let batches = load_input(&path).expect("load");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].documents.len(), 1);
    }
}
