//! On-disk index generations and the `CURRENT` pointer.
//!
//! Layout under the store root:
//!
//! ```text
//! CURRENT                      name of the serving generation
//! gen-<built_at_ms>-<n>/
//!     vectors.bin              header + row-major f32 LE
//!     chunks.json              chunk records, position i <-> vector i
//!     manifest.json            counts, dimensions, checksums
//! ```
//!
//! A build writes a fresh generation next to the live one and only then
//! replaces `CURRENT`, so a crash mid-write never leaves a half-written index
//! in service.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunker::Chunk;
use crate::config::ChunkingConfig;
use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::similarity::FlatInnerProduct;

const VECTORS_MAGIC: u32 = 0x4143_5156; // "VQCA" little-endian
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;
const CURRENT_FILE: &str = "CURRENT";
const VECTORS_FILE: &str = "vectors.bin";
const CHUNKS_FILE: &str = "chunks.json";
const MANIFEST_FILE: &str = "manifest.json";
const GENERATION_PREFIX: &str = "gen-";
const TMP_SUFFIX: &str = ".tmp";

/// Chunking parameters an index was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    /// Target chunk size.
    pub chunk_size: usize,
    /// Minimum chunk size.
    pub min_chunk_size: usize,
    /// Sliding-window overlap.
    pub overlap: usize,
    /// Dedup prefix length.
    pub dedup_prefix: usize,
}

impl From<&ChunkingConfig> for ChunkingParams {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            min_chunk_size: config.min_chunk_size,
            overlap: config.effective_overlap(),
            dedup_prefix: config.dedup_prefix,
        }
    }
}

/// Sidecar describing one persisted generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    /// On-disk format version.
    pub format_version: u32,
    /// Embedding model identifier.
    pub model: String,
    /// Vector dimension.
    pub dimensions: usize,
    /// Number of entries.
    pub count: usize,
    /// Chunker settings at build time.
    pub chunking: ChunkingParams,
    /// Build timestamp (ms since epoch).
    pub built_at_ms: u64,
    /// CRC32 of `vectors.bin`.
    pub vectors_crc32: u32,
    /// CRC32 of `chunks.json`.
    pub chunks_crc32: u32,
}

/// Directory-backed index persistence.
#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    /// Store rooted at `root`; nothing is touched until the first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the serving generation, if any.
    pub fn current_generation(&self) -> Result<Option<PathBuf>> {
        let pointer = self.root.join(CURRENT_FILE);
        let name = match fs::read_to_string(&pointer) {
            Ok(name) => name,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let name = name.trim();
        let escapes = name.contains(|ch: char| ch == '/' || ch == '\\');
        if name.is_empty() || !name.starts_with(GENERATION_PREFIX) || escapes {
            return Err(RagError::CorruptIndex(format!(
                "CURRENT points at invalid generation {name:?}"
            )));
        }
        Ok(Some(self.root.join(name)))
    }

    /// Persists `index` as a new generation, points `CURRENT` at it and prunes
    /// older generations. Returns the new generation directory.
    pub fn save(&self, index: &VectorIndex, chunking: &ChunkingConfig) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let previous = self.current_generation().ok().flatten();
        let name = self.next_generation_name(index.built_at_ms());
        let staging = self.root.join(format!("{name}{TMP_SUFFIX}"));
        let final_dir = self.root.join(&name);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let vectors = encode_vectors(index)?;
        let chunks = serde_json::to_vec_pretty(index.chunks())?;
        let manifest = IndexManifest {
            format_version: FORMAT_VERSION,
            model: index.model().to_string(),
            dimensions: index.dimensions(),
            count: index.len(),
            chunking: ChunkingParams::from(chunking),
            built_at_ms: index.built_at_ms(),
            vectors_crc32: crc32fast::hash(&vectors),
            chunks_crc32: crc32fast::hash(&chunks),
        };
        write_synced(&staging.join(VECTORS_FILE), &vectors)?;
        write_synced(&staging.join(CHUNKS_FILE), &chunks)?;
        write_synced(
            &staging.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;
        fs::rename(&staging, &final_dir)?;

        let pointer_tmp = self.root.join(format!("{CURRENT_FILE}{TMP_SUFFIX}"));
        write_synced(&pointer_tmp, name.as_bytes())?;
        fs::rename(&pointer_tmp, self.root.join(CURRENT_FILE))?;
        info!(
            generation = %name,
            entries = manifest.count,
            dims = manifest.dimensions,
            "index generation committed"
        );

        self.prune(&final_dir, previous.as_deref());
        Ok(final_dir)
    }

    /// Loads the serving generation. Fails with [`RagError::IndexNotReady`]
    /// when nothing has been built yet.
    pub fn load(&self) -> Result<(VectorIndex, IndexManifest)> {
        let dir = self.current_generation()?.ok_or(RagError::IndexNotReady)?;
        Self::load_generation(&dir)
    }

    /// Loads and verifies one generation directory.
    pub fn load_generation(dir: &Path) -> Result<(VectorIndex, IndexManifest)> {
        let manifest = read_manifest(dir)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(RagError::CorruptIndex(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }
        let vectors = fs::read(dir.join(VECTORS_FILE))?;
        if crc32fast::hash(&vectors) != manifest.vectors_crc32 {
            return Err(RagError::CorruptIndex(format!(
                "{VECTORS_FILE} checksum mismatch in {}",
                dir.display()
            )));
        }
        let chunk_bytes = fs::read(dir.join(CHUNKS_FILE))?;
        if crc32fast::hash(&chunk_bytes) != manifest.chunks_crc32 {
            return Err(RagError::CorruptIndex(format!(
                "{CHUNKS_FILE} checksum mismatch in {}",
                dir.display()
            )));
        }
        let backend = decode_vectors(&vectors, &manifest)?;
        let chunks: Vec<Chunk> = serde_json::from_slice(&chunk_bytes)?;
        if chunks.len() != manifest.count {
            return Err(RagError::CorruptIndex(format!(
                "manifest lists {} entries but {CHUNKS_FILE} holds {}",
                manifest.count,
                chunks.len()
            )));
        }
        let index = VectorIndex::new(
            manifest.model.clone(),
            chunks,
            Box::new(backend),
            manifest.built_at_ms,
        )?;
        debug!(dir = %dir.display(), entries = index.len(), "loaded index generation");
        Ok((index, manifest))
    }

    fn next_generation_name(&self, built_at_ms: u64) -> String {
        let mut n = 0usize;
        loop {
            let name = format!("{GENERATION_PREFIX}{built_at_ms}-{n}");
            if !self.root.join(&name).exists() {
                return name;
            }
            n += 1;
        }
    }

    /// Best-effort removal of everything but `keep` and `previous`.
    fn prune(&self, keep: &Path, previous: Option<&Path>) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "failed to list index root for pruning");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_generation = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(GENERATION_PREFIX));
            if !is_generation || !path.is_dir() || path == keep || Some(path.as_path()) == previous {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(dir = %path.display(), "pruned stale index generation"),
                Err(err) => warn!(dir = %path.display(), error = %err, "failed to prune index generation"),
            }
        }
    }
}

/// Reads `manifest.json` from a generation directory.
pub fn read_manifest(dir: &Path) -> Result<IndexManifest> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn encode_vectors(index: &VectorIndex) -> Result<Vec<u8>> {
    let dims = index.dimensions();
    let count = index.len();
    let dims_u32 = u32::try_from(dims)
        .map_err(|_| RagError::Embedding(format!("dimension {dims} does not fit the index format")))?;
    let count_u32 = u32::try_from(count)
        .map_err(|_| RagError::Embedding(format!("{count} entries do not fit the index format")))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + dims * count * 4);
    bytes.extend_from_slice(&VECTORS_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&dims_u32.to_le_bytes());
    bytes.extend_from_slice(&count_u32.to_le_bytes());
    for position in 0..count {
        let row = index
            .vector(position)
            .ok_or_else(|| RagError::CorruptIndex(format!("missing vector {position}")))?;
        for value in row {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    Ok(bytes)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn decode_vectors(bytes: &[u8], manifest: &IndexManifest) -> Result<FlatInnerProduct> {
    if bytes.len() < HEADER_LEN {
        return Err(RagError::CorruptIndex(format!("{VECTORS_FILE} too small (no header)")));
    }
    let magic = read_u32(bytes, 0);
    let version = read_u32(bytes, 4);
    let dims = read_u32(bytes, 8) as usize;
    let count = read_u32(bytes, 12) as usize;
    if magic != VECTORS_MAGIC {
        return Err(RagError::CorruptIndex(format!(
            "invalid {VECTORS_FILE} magic {magic:#X}"
        )));
    }
    if version != FORMAT_VERSION {
        return Err(RagError::CorruptIndex(format!(
            "unsupported {VECTORS_FILE} version {version}"
        )));
    }
    if dims != manifest.dimensions || count != manifest.count {
        return Err(RagError::CorruptIndex(format!(
            "{VECTORS_FILE} header ({dims}x{count}) disagrees with manifest ({}x{})",
            manifest.dimensions, manifest.count
        )));
    }
    let expected_len = HEADER_LEN + dims * count * 4;
    if bytes.len() != expected_len {
        return Err(RagError::CorruptIndex(format!(
            "{VECTORS_FILE} size mismatch: got {}, expected {expected_len}",
            bytes.len()
        )));
    }
    let data: Vec<f32> = bytes[HEADER_LEN..]
        .chunks_exact(4)
        .map(|word| f32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect();
    FlatInnerProduct::from_raw(dims, data)
        .ok_or_else(|| RagError::CorruptIndex(format!("{VECTORS_FILE} has zero dimensions")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use crate::document::Document;
    use crate::embedder::{Embedder, HashingEmbedder};
    use crate::index::IndexBuilder;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn build(texts: &[&str]) -> VectorIndex {
        let chunker = Chunker::new(ChunkingConfig::default());
        let chunks = texts
            .iter()
            .enumerate()
            .flat_map(|(i, text)| {
                chunker.normalize_and_chunk(&Document::new(format!("doc-{i}"), "u", "t", *text))
            })
            .collect();
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(24, 8));
        IndexBuilder::new(embedder, 8).build(chunks).expect("build")
    }

    fn generations(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root)
            .expect("read root")
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with(GENERATION_PREFIX))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = IndexStore::new(dir.path());
        let index = build(&["Admissions close in June.", "Fees are paid online."]);
        store.save(&index, &ChunkingConfig::default()).expect("save");

        let (loaded, manifest) = store.load().expect("load");
        assert_eq!(manifest.count, 2);
        assert_eq!(manifest.dimensions, 24);
        assert_eq!(manifest.model, "hashing-24");
        assert_eq!(manifest.chunking.chunk_size, 2000);
        assert_eq!(loaded.chunks(), index.chunks());
        for i in 0..index.len() {
            assert_eq!(loaded.vector(i), index.vector(i));
        }
    }

    #[test]
    fn vectors_file_has_expected_header() {
        let dir = tempdir().expect("tempdir");
        let store = IndexStore::new(dir.path());
        let generation = store
            .save(&build(&["one", "two", "three"]), &ChunkingConfig::default())
            .expect("save");
        let bytes = fs::read(generation.join(VECTORS_FILE)).expect("read");
        assert_eq!(read_u32(&bytes, 0), VECTORS_MAGIC);
        assert_eq!(read_u32(&bytes, 8), 24);
        assert_eq!(read_u32(&bytes, 12), 3);
        assert_eq!(bytes.len(), HEADER_LEN + 24 * 3 * 4);
    }

    #[test]
    fn missing_index_is_not_ready() {
        let dir = tempdir().expect("tempdir");
        let store = IndexStore::new(dir.path().join("nothing-here"));
        assert!(matches!(store.load(), Err(RagError::IndexNotReady)));
    }

    #[test]
    fn tampered_files_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = IndexStore::new(dir.path());
        let generation = store
            .save(&build(&["Library timings."]), &ChunkingConfig::default())
            .expect("save");
        let path = generation.join(CHUNKS_FILE);
        let mut text = fs::read_to_string(&path).expect("read");
        text = text.replace("Library", "Lobrary");
        fs::write(&path, text).expect("write");
        assert!(matches!(store.load(), Err(RagError::CorruptIndex(_))));
    }

    #[test]
    fn saves_keep_current_and_previous_generation() {
        let dir = tempdir().expect("tempdir");
        let store = IndexStore::new(dir.path());
        let first = store.save(&build(&["a"]), &ChunkingConfig::default()).expect("first");
        let second = store.save(&build(&["b"]), &ChunkingConfig::default()).expect("second");
        let third = store.save(&build(&["c"]), &ChunkingConfig::default()).expect("third");
        let names = generations(dir.path());
        assert_eq!(names.len(), 2, "{names:?}");
        assert!(!first.exists());
        assert!(second.exists());
        assert_eq!(store.current_generation().expect("pointer"), Some(third));
        let (loaded, _) = store.load().expect("load");
        assert_eq!(loaded.chunks()[0].content, "c");
    }

    #[test]
    fn rejects_pointer_escaping_root() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join(CURRENT_FILE), "../elsewhere").expect("write");
        let store = IndexStore::new(dir.path());
        assert!(matches!(store.current_generation(), Err(RagError::CorruptIndex(_))));
    }
}
