//! Raw crawl records and the batch loaders that turn crawler output into documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A single ingested document. Immutable once produced by the loaders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier assigned by the crawler (record id or URL).
    pub source_id: String,
    /// Canonical URL, possibly empty.
    pub url: String,
    /// Page or file title, possibly empty.
    pub title: String,
    /// Raw body: HTML or plain text.
    pub raw_text: String,
    /// Crawler fetch timestamp, passed through untouched.
    pub fetched_at: Option<String>,
    /// Source type (`html`, `pdf`, `raw`, ...), possibly empty.
    pub source_type: String,
    /// Chunk index assigned by the crawler, if any.
    pub chunk_index: Option<usize>,
}

impl Document {
    /// Builds a plain document without crawler extras.
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        raw_text: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            title: title.into(),
            raw_text: raw_text.into(),
            fetched_at: None,
            source_type: String::new(),
            chunk_index: None,
        }
    }

    /// Sets the source type.
    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }

    /// Sets the crawler-supplied chunk index.
    pub fn with_chunk_index(mut self, chunk_index: usize) -> Self {
        self.chunk_index = Some(chunk_index);
        self
    }

    /// Parses a crawler record, falling back across the field names the crawler and
    /// processing stages have used over time.
    pub fn from_record(record: &Value) -> Result<Self, MalformedReason> {
        let object = record.as_object().ok_or(MalformedReason::NotAnObject)?;
        let empty = Map::new();
        let meta = object
            .get("meta")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let url = string_field(meta, "url")
            .or_else(|| string_field(object, "url"))
            .unwrap_or_default();
        let source_id = string_field(object, "id")
            .or_else(|| string_field(object, "url"))
            .or_else(|| (!url.is_empty()).then(|| url.clone()))
            .ok_or(MalformedReason::MissingId)?;

        // Null and blank values fall through to the next field.
        let raw_text = ["text", "content", "body"]
            .iter()
            .find_map(|key| object.get(*key).filter(|value| !is_blank(value)))
            .map(|value| {
                value
                    .as_str()
                    .map(str::to_string)
                    .ok_or(MalformedReason::TextNotString)
            })
            .transpose()?
            .ok_or(MalformedReason::MissingText)?;

        let title = string_field(meta, "title")
            .or_else(|| string_field(object, "title"))
            .unwrap_or_default();
        let fetched_at = string_field(meta, "fetched_at").or_else(|| string_field(meta, "fetched"));
        let source_type = string_field(meta, "type")
            .or_else(|| string_field(object, "type"))
            .unwrap_or_default();
        let chunk_index = meta
            .get("chunk_index")
            .and_then(Value::as_u64)
            .map(|idx| idx as usize);

        Ok(Self {
            source_id,
            url,
            title,
            raw_text,
            fetched_at,
            source_type,
            chunk_index,
        })
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Why a raw entry could not become a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    /// The entry is not a JSON object.
    NotAnObject,
    /// Neither `id` nor `url` is present.
    MissingId,
    /// None of `text`, `content`, `body` is present.
    MissingText,
    /// The text field is not a string.
    TextNotString,
    /// The line is not valid JSON.
    InvalidJson(String),
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "entry is not a JSON object"),
            Self::MissingId => write!(f, "entry has neither id nor url"),
            Self::MissingText => write!(f, "entry has no text, content or body"),
            Self::TextNotString => write!(f, "text field is not a string"),
            Self::InvalidJson(err) => write!(f, "invalid JSON: {err}"),
        }
    }
}

/// A skipped entry and its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEntry {
    /// 1-based position (line number for JSONL, array index + 1 otherwise).
    pub position: usize,
    /// Reason the entry was skipped.
    pub reason: MalformedReason,
}

/// Documents originating from one source file; the scope for prefix dedup.
#[derive(Debug, Clone, Default)]
pub struct DocumentBatch {
    /// Batch label (usually the source file name).
    pub name: String,
    /// Parsed documents in file order.
    pub documents: Vec<Document>,
    /// Entries skipped while parsing.
    pub malformed: Vec<MalformedEntry>,
}

impl DocumentBatch {
    /// Wraps already-parsed documents.
    pub fn new(name: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            name: name.into(),
            documents,
            malformed: Vec::new(),
        }
    }

    /// Parses a list of raw records, skipping and counting malformed ones.
    pub fn from_records(name: impl Into<String>, records: &[Value]) -> Self {
        let mut batch = Self::new(name, Vec::new());
        for (idx, record) in records.iter().enumerate() {
            batch.push_record(idx + 1, record);
        }
        batch
    }

    fn push_record(&mut self, position: usize, record: &Value) {
        match Document::from_record(record) {
            Ok(document) => self.documents.push(document),
            Err(reason) => {
                warn!(batch = %self.name, position, %reason, "skipping malformed document");
                self.malformed.push(MalformedEntry { position, reason });
            }
        }
    }
}

const JSON_LINES_EXTENSIONS: [&str; 3] = ["jsonl", "ndjson", "jsonlines"];

/// True when the path has one of the raw corpus extensions.
pub fn is_corpus_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ext == "json" || JSON_LINES_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Loads one `.json` / `.jsonl` / `.ndjson` / `.jsonlines` file into a batch.
///
/// JSON files may contain an array, an object wrapping a `chunks` or `items`
/// array, or a single record. JSON-lines files are parsed line by line; bad
/// lines are skipped and counted rather than failing the file.
pub fn load_file(path: &Path) -> anyhow::Result<DocumentBatch> {
    use anyhow::Context;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let lines_format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| JSON_LINES_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);

    if lines_format {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let mut batch = DocumentBatch::new(name, Vec::new());
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(record) => batch.push_record(line_no + 1, &record),
                Err(err) => {
                    warn!(batch = %batch.name, line = line_no + 1, %err, "skipping undecodable line");
                    batch.malformed.push(MalformedEntry {
                        position: line_no + 1,
                        reason: MalformedReason::InvalidJson(err.to_string()),
                    });
                }
            }
        }
        return Ok(batch);
    }

    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let parsed: Value =
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {:?}", path))?;
    let records = match parsed {
        Value::Array(items) => items,
        Value::Object(mut object) => match ["chunks", "items"]
            .iter()
            .find(|key| object.get(**key).map(Value::is_array).unwrap_or(false))
        {
            Some(key) => match object.remove(*key) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            None => vec![Value::Object(object)],
        },
        other => anyhow::bail!("unsupported JSON structure in {:?}: {}", path, type_name(&other)),
    };
    Ok(DocumentBatch::from_records(name, &records))
}

/// Loads every corpus file under `dir` (non-recursive) in sorted file-name order.
///
/// A file that cannot be read at all is logged and skipped; the remaining
/// files still load.
pub fn load_dir(dir: &Path) -> anyhow::Result<Vec<DocumentBatch>> {
    use anyhow::Context;

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to list {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && is_corpus_file(path))
        .collect();
    paths.sort();

    let mut batches = Vec::with_capacity(paths.len());
    for path in paths {
        match load_file(&path) {
            Ok(batch) => {
                debug!(
                    file = %path.display(),
                    documents = batch.documents.len(),
                    malformed = batch.malformed.len(),
                    "loaded corpus file"
                );
                batches.push(batch);
            }
            Err(err) => warn!(file = %path.display(), "failed to load corpus file: {err:#}"),
        }
    }
    Ok(batches)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
