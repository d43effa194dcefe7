//! Flat inner-product vector index with on-disk artifacts.
//!
//! Entries are kept in insertion order and searched by exhaustive scan.
//! Vectors are expected to be L2-normalised, so the inner product is the
//! cosine similarity.
//!
//! # Artifacts
//!
//! | File | Contents |
//! |------|----------|
//! | `docstore.json` | chunk ids, texts, hashes, metadata in index order |
//! | `vector_store.json` | descriptor: format version, metric, dims, count |
//! | `vectors.index` | native vector data: header + little-endian f32 rows |
//!
//! A directory is a valid index only when all three files are present.
//! Each write stamps all three files with the same generation id, so a
//! directory left holding a mix of two writes is detected on read.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::embedding::{blob_to_vec, inner_product, vec_to_blob};
use crate::error::{RagError, Result};
use crate::models::{ChunkMetadata, IndexEntry};

pub const DOCSTORE_FILE: &str = "docstore.json";
pub const DESCRIPTOR_FILE: &str = "vector_store.json";
pub const VECTORS_FILE: &str = "vectors.index";

/// Every file a persisted index consists of.
pub const ARTIFACTS: [&str; 3] = [DOCSTORE_FILE, DESCRIPTOR_FILE, VECTORS_FILE];

const MAGIC: &[u8; 4] = b"RAGV";
const FORMAT_VERSION: u32 = 1;
/// magic, version, dims, count, generation
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 16;

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dims: usize,
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct Descriptor {
    format_version: u32,
    generation: String,
    metric: String,
    dims: usize,
    count: usize,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    chunk_id: String,
    text: String,
    hash: String,
    metadata: ChunkMetadata,
}

#[derive(Serialize, Deserialize)]
struct DocStore {
    generation: String,
    entries: Vec<StoredEntry>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, chunk_id: &str) -> Option<&IndexEntry> {
        self.positions.get(chunk_id).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Insert an entry, replacing any entry with the same chunk id in place.
    pub fn upsert(&mut self, entry: IndexEntry) -> Result<()> {
        if entry.embedding.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: entry.embedding.len(),
            });
        }

        match self.positions.get(&entry.chunk_id) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.positions
                    .insert(entry.chunk_id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    /// Drop every chunk that came from corpus file `source_file`.
    /// Returns how many were removed.
    pub fn remove_source(&mut self, source_file: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.metadata.source_file != source_file);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.reindex_positions();
        }
        removed
    }

    /// Return up to `k` entries by descending score; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(f32, &IndexEntry)>> {
        if query.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(f32, &IndexEntry)> = self
            .entries
            .iter()
            .map(|e| (inner_product(query, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Write all artifacts into `dir`, which must already exist.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let generation = Uuid::new_v4();

        let docstore = DocStore {
            generation: generation.to_string(),
            entries: self
                .entries
                .iter()
                .map(|e| StoredEntry {
                    chunk_id: e.chunk_id.clone(),
                    text: e.text.clone(),
                    hash: e.hash.clone(),
                    metadata: e.metadata.clone(),
                })
                .collect(),
        };
        fs::write(
            dir.join(DOCSTORE_FILE),
            serde_json::to_vec_pretty(&docstore)?,
        )?;

        let descriptor = Descriptor {
            format_version: FORMAT_VERSION,
            generation: generation.to_string(),
            metric: "inner_product".to_string(),
            dims: self.dims,
            count: self.entries.len(),
        };
        fs::write(
            dir.join(DESCRIPTOR_FILE),
            serde_json::to_vec_pretty(&descriptor)?,
        )?;

        let mut native = Vec::with_capacity(HEADER_LEN + self.entries.len() * self.dims * 4);
        native.extend_from_slice(MAGIC);
        native.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        native.extend_from_slice(&(self.dims as u32).to_le_bytes());
        native.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        native.extend_from_slice(generation.as_bytes());
        for entry in &self.entries {
            native.extend_from_slice(&vec_to_blob(&entry.embedding));
        }
        fs::write(dir.join(VECTORS_FILE), native)?;

        Ok(())
    }

    /// Read an index back from `dir`, checking the artifacts agree.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let descriptor: Descriptor =
            serde_json::from_slice(&fs::read(dir.join(DESCRIPTOR_FILE))?)?;
        let docstore: DocStore = serde_json::from_slice(&fs::read(dir.join(DOCSTORE_FILE))?)?;
        let native = fs::read(dir.join(VECTORS_FILE))?;

        if descriptor.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                descriptor.format_version
            )));
        }
        if native.len() < HEADER_LEN || &native[..4] != MAGIC {
            return Err(corrupt("vector file header is invalid".to_string()));
        }

        let dims = u32::from_le_bytes([native[8], native[9], native[10], native[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&native[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;
        let generation = Uuid::from_slice(&native[20..HEADER_LEN])
            .map_err(|e| corrupt(format!("bad generation id: {}", e)))?
            .to_string();

        if generation != descriptor.generation || generation != docstore.generation {
            return Err(corrupt(
                "artifacts come from different writes".to_string(),
            ));
        }

        if dims != descriptor.dims || count != descriptor.count {
            return Err(corrupt(format!(
                "descriptor ({} x {}) disagrees with vector file ({} x {})",
                descriptor.count, descriptor.dims, count, dims
            )));
        }
        if count != docstore.entries.len() {
            return Err(corrupt(format!(
                "docstore has {} entries, vector file has {}",
                docstore.entries.len(),
                count
            )));
        }
        let body = &native[HEADER_LEN..];
        if body.len() != count * dims * 4 {
            return Err(corrupt(format!(
                "vector file holds {} bytes, expected {}",
                body.len(),
                count * dims * 4
            )));
        }

        let mut index = VectorIndex::new(dims);
        let row_len = dims * 4;
        for (i, stored) in docstore.entries.into_iter().enumerate() {
            let row = &body[i * row_len..(i + 1) * row_len];
            index.upsert(IndexEntry {
                chunk_id: stored.chunk_id,
                embedding: blob_to_vec(row),
                text: stored.text,
                hash: stored.hash,
                metadata: stored.metadata,
            })?;
        }

        Ok(index)
    }

    fn reindex_positions(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.chunk_id.clone(), i))
            .collect();
    }
}

/// Whether `dir` holds every index artifact.
pub fn artifacts_present(dir: &Path) -> bool {
    ARTIFACTS.iter().all(|name| dir.join(name).is_file())
}

fn corrupt(reason: String) -> RagError {
    RagError::Persistence(format!("corrupt index: {}", reason))
}
